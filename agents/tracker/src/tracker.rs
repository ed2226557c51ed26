use std::sync::Arc;

use eyre::{Result, WrapErr};
use futures_util::future::select_all;
use tokio::task::JoinHandle;
use tracing::{info, instrument::Instrumented, warn};

use crossflow_base::db::FlowDb;
use crossflow_base::{CoreMetrics, Settings, StatusEventBus};
use crossflow_core::{ChainRegistry, ChainType, FlowStore, StatusEvents};
use crossflow_cosmos::TendermintRpcClient;
use crossflow_ethereum::EvmRpcClient;

use crate::engine::{ProviderSet, TrackerEngine};
use crate::queue::JobQueue;
use crate::server::{serve, AppState};
use crate::supervisor::FlowSupervisor;
use crate::worker::FlowWorker;

/// The tracker agent: store, engine, worker pool and API server wired
/// together from settings.
pub struct TrackerAgent {
    settings: Settings,
    state: AppState,
    worker: Arc<FlowWorker>,
    // Held so the supervisor task lives as long as the agent.
    _supervisor_task: JoinHandle<()>,
}

impl TrackerAgent {
    /// Connect collaborators and assemble the agent.
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        let metrics = Arc::new(CoreMetrics::new().wrap_err("failed to register metrics")?);

        let db = FlowDb::connect(&settings.database_url)
            .await
            .wrap_err("failed to connect to database")?;
        db.ensure_schema().await.wrap_err("failed to ensure schema")?;
        let store: Arc<dyn FlowStore> = Arc::new(db);

        let bus = Arc::new(StatusEventBus::new());
        let registry = Arc::new(settings.registry.clone());
        let providers = build_providers(&registry)?;

        let (supervisor, supervisor_task) = FlowSupervisor::spawn();
        let engine = Arc::new(
            TrackerEngine::new(
                store.clone(),
                bus.clone() as Arc<dyn StatusEvents>,
                registry.clone(),
                settings.polling.clone(),
                providers,
                metrics.clone(),
            )
            .with_supervisor(supervisor.clone()),
        );

        let queue = JobQueue::new();
        let worker = Arc::new(FlowWorker::new(
            queue.clone(),
            engine,
            supervisor,
            store.clone(),
            metrics.clone(),
        ));

        let state = AppState {
            store,
            bus,
            registry,
            queue,
            metrics,
        };

        Ok(Self {
            settings,
            state,
            worker,
            _supervisor_task: supervisor_task,
        })
    }

    /// Run every agent task until the first one exits.
    pub async fn run(self) -> Result<()> {
        let resumed = self
            .worker
            .resume_unfinished()
            .await
            .wrap_err("failed to resume unfinished flows")?;
        info!(resumed, "tracker starting");

        let mut tasks = self.worker.clone().spawn();
        tasks.push(serve(
            self.state,
            self.settings.host.clone(),
            self.settings.port,
            self.settings.cors_origins.clone(),
        ));

        run_all(tasks).await
    }
}

/// Build one RPC client per registered chain.
fn build_providers(registry: &ChainRegistry) -> Result<ProviderSet> {
    let mut providers = ProviderSet::default();
    for (chain_id, conf) in registry.iter() {
        let Some(raw_url) = conf.rpc_urls.first() else {
            warn!(chain = %chain_id, "chain registered without rpc urls, skipping");
            continue;
        };
        let url = raw_url
            .parse()
            .wrap_err_with(|| format!("invalid rpc url for {chain_id}"))?;
        match conf.chain_type {
            ChainType::Evm => {
                let client = EvmRpcClient::new(url)
                    .map_err(|e| eyre::eyre!("failed to build evm client for {chain_id}: {e}"))?;
                providers.evm.insert(chain_id.clone(), Arc::new(client));
            }
            ChainType::Tendermint => {
                let client = TendermintRpcClient::new(url).map_err(|e| {
                    eyre::eyre!("failed to build tendermint client for {chain_id}: {e}")
                })?;
                providers
                    .tendermint
                    .insert(chain_id.clone(), Arc::new(client));
            }
        }
    }
    Ok(providers)
}

/// Run tasks until any one ends, then wind the rest down.
async fn run_all(tasks: Vec<Instrumented<JoinHandle<Result<()>>>>) -> Result<()> {
    debug_assert!(!tasks.is_empty(), "no tasks submitted");
    let (result, _, remaining) = select_all(tasks).await;
    for task in remaining {
        task.into_inner().abort();
    }
    result?
}
