use std::collections::HashMap;
use std::env;
use std::fs;

use config::{Config, Environment, File};
use eyre::{Context, Result};
use serde::Deserialize;

use crossflow_core::{ChainRegistry, PollingConfigs};

pub use crate::trace::TracingLevel;

/// Raw environment-facing settings.
///
/// Loaded from optional config files (`CONFIG_FILES`, comma-separated) with
/// flat environment variables layered on top: `PORT`, `HOST`, `LOG_LEVEL`,
/// `CORS_ORIGINS`, `DATABASE_URL`, `EVM_RPC_URLS`, `TENDERMINT_RPC_URLS`,
/// `CHAIN_REGISTRY_PATH`, `CHAIN_POLLING_CONFIGS`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    /// HTTP listen port.
    pub port: u16,
    /// HTTP bind address.
    pub host: String,
    /// Log level name.
    pub log_level: TracingLevel,
    /// Comma-separated CORS origins; `*` allows any.
    pub cors_origins: String,
    /// Postgres connection string.
    pub database_url: String,
    /// Per-chain EVM RPC overrides, `chain=url` pairs comma-separated.
    pub evm_rpc_urls: String,
    /// Per-chain Tendermint RPC overrides, `chain=url` pairs comma-separated.
    pub tendermint_rpc_urls: String,
    /// Path of the chain registry JSON file.
    pub chain_registry_path: String,
    /// Inline JSON override for per-chain polling configuration.
    pub chain_polling_configs: String,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_owned(),
            log_level: TracingLevel::default(),
            cors_origins: String::new(),
            database_url: "postgres://localhost/crossflow".to_owned(),
            evm_rpc_urls: String::new(),
            tendermint_rpc_urls: String::new(),
            chain_registry_path: "./config/chains.json".to_owned(),
            chain_polling_configs: String::new(),
        }
    }
}

/// Fully resolved agent settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP listen port.
    pub port: u16,
    /// HTTP bind address.
    pub host: String,
    /// Log level.
    pub log_level: TracingLevel,
    /// Allowed CORS origins; empty means same-origin only, `*` means any.
    pub cors_origins: Vec<String>,
    /// Postgres connection string.
    pub database_url: String,
    /// Chain registry with RPC overrides applied.
    pub registry: ChainRegistry,
    /// Per-chain polling configuration with overrides applied.
    pub polling: PollingConfigs,
}

impl Settings {
    /// Load settings from config files and the environment, then resolve the
    /// chain registry and polling configuration.
    pub fn load() -> Result<Self> {
        let raw = load_raw()?;
        Self::from_raw(raw)
    }

    /// Resolve raw settings into runtime settings.
    pub fn from_raw(raw: RawSettings) -> Result<Self> {
        let registry_json = fs::read_to_string(&raw.chain_registry_path).wrap_err_with(|| {
            format!("failed to read chain registry at {}", raw.chain_registry_path)
        })?;
        let mut registry: ChainRegistry =
            serde_json::from_str(&registry_json).wrap_err("invalid chain registry JSON")?;

        apply_rpc_overrides(&mut registry, &raw.evm_rpc_urls);
        apply_rpc_overrides(&mut registry, &raw.tendermint_rpc_urls);

        let mut polling = PollingConfigs::default();
        if !raw.chain_polling_configs.is_empty() {
            let overrides: PollingConfigs = serde_json::from_str(&raw.chain_polling_configs)
                .wrap_err("invalid CHAIN_POLLING_CONFIGS JSON")?;
            polling.merge(overrides);
        }

        Ok(Self {
            port: raw.port,
            host: raw.host,
            log_level: raw.log_level,
            cors_origins: split_csv(&raw.cors_origins),
            database_url: raw.database_url,
            registry,
            polling,
        })
    }
}

fn load_raw() -> Result<RawSettings> {
    let mut builder = Config::builder();

    let config_file_paths: Vec<String> = env::var("CONFIG_FILES")
        .ok()
        .map(|s| s.split(',').map(str::to_owned).collect())
        .unwrap_or_default();
    for path in &config_file_paths {
        builder = builder.add_source(File::with_name(path));
    }

    let deserializer = builder
        .add_source(Environment::default().try_parsing(true))
        .build()
        .wrap_err("failed to assemble configuration")?;

    serde_path_to_error::deserialize(deserializer)
        .map_err(|err| eyre::eyre!("invalid config at `{}`: {}", err.path(), err))
}

/// Apply `chain=url` comma-separated RPC overrides onto the registry.
fn apply_rpc_overrides(registry: &mut ChainRegistry, overrides: &str) {
    let pairs: HashMap<&str, &str> = overrides
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(chain, url)| (chain.trim(), url.trim()))
        .filter(|(chain, url)| !chain.is_empty() && !url.is_empty())
        .collect();
    for (chain, url) in pairs {
        if let Some(conf) = registry.0.get_mut(chain) {
            conf.rpc_urls = vec![url.to_owned()];
        }
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use crossflow_core::{ChainConf, ChainType};

    use super::*;

    fn registry_with(chain: &str) -> ChainRegistry {
        let mut registry = ChainRegistry::default();
        registry.0.insert(
            chain.to_owned(),
            ChainConf {
                chain_type: ChainType::Evm,
                network: "testnet".into(),
                display_name: chain.to_owned(),
                rpc_urls: vec!["http://default:8545".into()],
                explorer: None,
                contracts: None,
                gasless: None,
            },
        );
        registry
    }

    #[test]
    fn rpc_overrides_replace_registry_urls() {
        let mut registry = registry_with("sepolia");
        apply_rpc_overrides(&mut registry, "sepolia=http://override:8545, unknown=http://x");
        assert_eq!(
            registry.get("sepolia").unwrap().rpc_urls,
            vec!["http://override:8545".to_owned()]
        );
    }

    #[test]
    fn csv_splitting_trims_and_drops_empties() {
        assert_eq!(
            split_csv(" https://a.example , ,https://b.example"),
            vec!["https://a.example".to_owned(), "https://b.example".to_owned()]
        );
        assert!(split_csv("").is_empty());
    }
}
