use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of chain roles a flow can touch.
///
/// A flow's `chain_progress` is keyed by these; chain ids from the registry
/// (e.g. `sepolia`, `noble-testnet`) map onto a key via
/// [`ChainConf::progress_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKey {
    /// EVM source or destination chain.
    Evm,
    /// The Noble CCTP/forwarding hub.
    Noble,
    /// The Namada shielded destination or source.
    Namada,
}

impl ChainKey {
    /// Stable lowercase name used in URLs, logs and stored JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKey::Evm => "evm",
            ChainKey::Noble => "noble",
            ChainKey::Namada => "namada",
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainKey {
    type Err = UnknownChainKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evm" => Ok(ChainKey::Evm),
            "noble" => Ok(ChainKey::Noble),
            "namada" => Ok(ChainKey::Namada),
            other => Err(UnknownChainKey(other.to_owned())),
        }
    }
}

/// A chain key outside the closed `evm`/`noble`/`namada` set.
#[derive(Debug, thiserror::Error)]
#[error("unknown chain key: {0}")]
pub struct UnknownChainKey(pub String);

/// Execution environment of a registered chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    /// JSON-RPC over HTTP, `eth_*` namespace.
    Evm,
    /// Tendermint/CometBFT RPC surface.
    Tendermint,
}

/// Well-known contract addresses for an EVM chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainContracts {
    /// USDC token contract.
    pub usdc: Option<String>,
    /// CCTP token messenger.
    pub token_messenger: Option<String>,
    /// CCTP message transmitter.
    pub message_transmitter: Option<String>,
}

/// One registry entry describing how to reach and interpret a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConf {
    /// Execution environment.
    pub chain_type: ChainType,
    /// Network name, e.g. `testnet`.
    pub network: String,
    /// Human-readable name for UIs.
    pub display_name: String,
    /// RPC endpoints, first entry preferred.
    pub rpc_urls: Vec<String>,
    /// Optional block explorer base URL.
    pub explorer: Option<String>,
    /// Known contract addresses (EVM chains).
    pub contracts: Option<ChainContracts>,
    /// Whether the chain supports gasless client flows.
    pub gasless: Option<bool>,
}

impl ChainConf {
    /// Map this chain onto its progress key.
    ///
    /// EVM chains are always `evm`. Tendermint chains are told apart by
    /// their id: anything mentioning `namada` is the shielded side,
    /// everything else is the Noble hub.
    pub fn progress_key(&self, chain_id: &str) -> ChainKey {
        match self.chain_type {
            ChainType::Evm => ChainKey::Evm,
            ChainType::Tendermint => {
                if chain_id.contains("namada") || self.network.contains("namada") {
                    ChainKey::Namada
                } else {
                    ChainKey::Noble
                }
            }
        }
    }
}

/// Registry of all chains the tracker knows about, keyed by chain id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainRegistry(pub HashMap<String, ChainConf>);

impl ChainRegistry {
    /// Look up a chain by id.
    pub fn get(&self, chain_id: &str) -> Option<&ChainConf> {
        self.0.get(chain_id)
    }

    /// True when the chain id is registered.
    pub fn contains(&self, chain_id: &str) -> bool {
        self.0.contains_key(chain_id)
    }

    /// Progress key for a registered chain id.
    pub fn progress_key(&self, chain_id: &str) -> Option<ChainKey> {
        self.get(chain_id).map(|c| c.progress_key(chain_id))
    }

    /// Iterate over `(chain_id, conf)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ChainConf)> {
        self.0.iter()
    }
}

/// Per-chain polling knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainPollingConf {
    /// Wall-clock budget for one stage, in minutes.
    pub max_duration_min: u64,
    /// How far behind the tip scanning starts when no start block is known.
    pub block_window_backscan: u64,
    /// Sleep between tip polls once caught up, in milliseconds.
    pub poll_interval_ms: u64,
    /// Sleep between consecutive block fetches, in milliseconds.
    pub block_request_delay_ms: Option<u64>,
}

impl Default for ChainPollingConf {
    fn default() -> Self {
        Self {
            max_duration_min: 30,
            block_window_backscan: 20,
            poll_interval_ms: 5_000,
            block_request_delay_ms: None,
        }
    }
}

/// Polling configuration per chain id, falling back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PollingConfigs(pub HashMap<String, ChainPollingConf>);

impl PollingConfigs {
    /// Resolve the polling configuration for a chain, defaulted when absent.
    pub fn for_chain(&self, chain_id: &str) -> ChainPollingConf {
        self.0.get(chain_id).cloned().unwrap_or_default()
    }

    /// Overlay explicit overrides on top of this configuration.
    pub fn merge(&mut self, overrides: PollingConfigs) {
        self.0.extend(overrides.0);
    }
}
