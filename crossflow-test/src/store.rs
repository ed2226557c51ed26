use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crossflow_core::{
    ChainKey, ChainProgress, ChainStatus, CreateOutcome, ErrorState, Flow, FlowStatus, FlowStore,
    NewFlow, NewStatusLog, Stage, StatusLogRow, StatusWrite, StoreError, StoreResult,
};

/// In-memory [`FlowStore`] with the same invariant enforcement as the
/// relational implementation: idempotent creation, write-once start blocks
/// and the terminal-status lattice.
#[derive(Debug, Default)]
pub struct MemoryFlowStore {
    state: Mutex<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    flows: HashMap<Uuid, Flow>,
    logs: Vec<StatusLogRow>,
    next_log_id: i64,
}

impl MemoryFlowStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored flow, for assertions.
    pub fn all_flows(&self) -> Vec<Flow> {
        self.state.lock().unwrap().flows.values().cloned().collect()
    }

    fn with_flow<T>(
        &self,
        id: Uuid,
        mutate: impl FnOnce(&mut Flow) -> T,
    ) -> StoreResult<(T, Flow)> {
        let mut state = self.state.lock().unwrap();
        let flow = state.flows.get_mut(&id).ok_or(StoreError::NotFound)?;
        let out = mutate(flow);
        flow.updated_at = Utc::now();
        Ok((out, flow.clone()))
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn create_flow(&self, new: NewFlow) -> StoreResult<CreateOutcome> {
        let mut state = self.state.lock().unwrap();
        if let Some(hash) = &new.tx_hash {
            if let Some(existing) = state
                .flows
                .values()
                .find(|f| f.tx_hash.as_deref() == Some(hash.as_str()))
            {
                return Ok(CreateOutcome::Existing(existing.clone()));
            }
        }
        let now = Utc::now();
        let flow = Flow {
            id: Uuid::new_v4(),
            tx_hash: new.tx_hash,
            flow_type: new.flow_type,
            initial_chain: new.initial_chain,
            destination_chain: new.destination_chain,
            status: FlowStatus::Pending,
            chain_progress: new
                .chain_progress
                .unwrap_or_else(|| ChainProgress::initial(new.flow_type)),
            metadata: new.metadata,
            error_state: None,
            created_at: now,
            updated_at: now,
        };
        state.flows.insert(flow.id, flow.clone());
        Ok(CreateOutcome::Created(flow))
    }

    async fn flow(&self, id: Uuid) -> StoreResult<Option<Flow>> {
        Ok(self.state.lock().unwrap().flows.get(&id).cloned())
    }

    async fn flow_by_tx_hash(&self, tx_hash: &str) -> StoreResult<Option<Flow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .flows
            .values()
            .find(|f| f.tx_hash.as_deref() == Some(tx_hash))
            .cloned())
    }

    async fn flow_by_any_hash(&self, chain: ChainKey, tx_hash: &str) -> StoreResult<Option<Flow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .flows
            .values()
            .find(|f| {
                if f.tx_hash.as_deref() == Some(tx_hash) {
                    return true;
                }
                f.chain_progress.get(chain).is_some_and(|entry| {
                    entry.tx_hash.as_deref() == Some(tx_hash)
                        || entry
                            .stages
                            .iter()
                            .chain(entry.gasless_stages.iter())
                            .any(|s| s.tx_hash.as_deref() == Some(tx_hash))
                })
            })
            .cloned())
    }

    async fn list_unfinished(&self) -> StoreResult<Vec<Flow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .flows
            .values()
            .filter(|f| !f.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn ensure_start_block(
        &self,
        id: Uuid,
        chain: ChainKey,
        computed: u64,
    ) -> StoreResult<u64> {
        let (effective, _) = self.with_flow(id, |flow| {
            let entry = flow.chain_progress.entry_mut(chain);
            *entry.start_block.get_or_insert(computed)
        })?;
        Ok(effective)
    }

    async fn append_stage(&self, id: Uuid, chain: ChainKey, stage: Stage) -> StoreResult<Flow> {
        let (_, flow) = self.with_flow(id, |flow| {
            flow.chain_progress.entry_mut(chain).stages.push(stage);
        })?;
        Ok(flow)
    }

    async fn append_client_stage(
        &self,
        id: Uuid,
        chain: ChainKey,
        stage: Stage,
        gasless: bool,
    ) -> StoreResult<Flow> {
        let (_, flow) = self.with_flow(id, |flow| {
            let entry = flow.chain_progress.entry_mut(chain);
            if gasless {
                entry.gasless_stages.push(stage);
            } else {
                entry.stages.push(stage);
            }
        })?;
        Ok(flow)
    }

    async fn set_chain_status(
        &self,
        id: Uuid,
        chain: ChainKey,
        status: ChainStatus,
        tx_hash: Option<String>,
    ) -> StoreResult<Flow> {
        let (_, flow) = self.with_flow(id, |flow| {
            let entry = flow.chain_progress.entry_mut(chain);
            entry.status = status;
            entry.last_checked_at = Some(Utc::now());
            if tx_hash.is_some() {
                entry.tx_hash = tx_hash;
            }
        })?;
        Ok(flow)
    }

    async fn set_status_if_pending(
        &self,
        id: Uuid,
        status: FlowStatus,
        error: Option<ErrorState>,
    ) -> StoreResult<StatusWrite> {
        let mut state = self.state.lock().unwrap();
        let flow = state.flows.get_mut(&id).ok_or(StoreError::NotFound)?;
        if flow.status.is_terminal() {
            return Ok(StatusWrite::AlreadyTerminal(flow.status));
        }
        flow.status = status;
        if error.is_some() {
            flow.error_state = error;
        }
        flow.updated_at = Utc::now();
        Ok(StatusWrite::Applied(flow.clone()))
    }

    async fn append_status_log(&self, row: NewStatusLog) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.next_log_id += 1;
        let id = state.next_log_id;
        state.logs.push(StatusLogRow {
            id,
            flow_id: row.flow_id,
            stage: row.stage,
            chain: row.chain,
            source: row.source,
            detail: row.detail,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn status_logs(&self, id: Uuid) -> StoreResult<Vec<StatusLogRow>> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<StatusLogRow> = state
            .logs
            .iter()
            .filter(|row| row.flow_id == id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }
}
