use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{ChainKey, FlowType};

/// Overall verdict for a tracked flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    /// Still being observed.
    Pending,
    /// Every required stage confirmed.
    Completed,
    /// Unrecoverable error while tracking.
    Failed,
    /// Observation window exhausted without a terminal on-chain event.
    Undetermined,
}

impl FlowStatus {
    /// Terminal statuses must never be overwritten.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowStatus::Pending)
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Pending => "pending",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Undetermined => "undetermined",
        }
    }
}

/// Per-chain and per-stage status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    /// Not yet observed.
    Pending,
    /// Observed and matched.
    Confirmed,
    /// Observation gave up.
    Failed,
}

impl ChainStatus {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Pending => "pending",
            ChainStatus::Confirmed => "confirmed",
            ChainStatus::Failed => "failed",
        }
    }
}

/// Where a stage entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageSource {
    /// Observed by a chain poller.
    Poller,
    /// Reported by the initiating client.
    Client,
}

impl StageSource {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageSource::Poller => "poller",
            StageSource::Client => "client",
        }
    }
}

/// One observation in a flow's progression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Symbolic stage name, e.g. `noble_cctp_minted`.
    pub stage: String,
    /// Status of this observation.
    pub status: ChainStatus,
    /// Optional human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Transaction hash where the stage was observed, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// When the observation happened.
    pub occurred_at: DateTime<Utc>,
    /// Poller- or client-sourced.
    pub source: StageSource,
    /// Free-form extra data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Stage {
    /// A confirmed poller-sourced stage observed now.
    pub fn confirmed(stage: &str, tx_hash: Option<String>) -> Self {
        Self {
            stage: stage.to_owned(),
            status: ChainStatus::Confirmed,
            message: None,
            tx_hash,
            occurred_at: Utc::now(),
            source: StageSource::Poller,
            metadata: None,
        }
    }
}

/// Per-chain sub-state of a flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainProgressEntry {
    /// Chain-level status.
    pub status: ChainStatus,
    /// Hash of the transaction that confirmed this chain, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Height at which scanning began. Written once, never re-derived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
    /// Last time a poller touched this chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Ordered poller observations.
    pub stages: Vec<Stage>,
    /// Ordered client-reported auxiliary stages (EVM only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gasless_stages: Vec<Stage>,
}

impl Default for ChainStatus {
    fn default() -> Self {
        ChainStatus::Pending
    }
}

/// Fixed record of per-chain progress; the key set is closed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainProgress {
    /// EVM chain entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evm: Option<ChainProgressEntry>,
    /// Noble hub entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noble: Option<ChainProgressEntry>,
    /// Namada entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namada: Option<ChainProgressEntry>,
}

impl ChainProgress {
    /// The initial key set for a new flow of the given type.
    pub fn initial(flow_type: FlowType) -> Self {
        let mut progress = Self::default();
        match flow_type {
            FlowType::Deposit => {
                progress.noble = Some(ChainProgressEntry::default());
                progress.namada = Some(ChainProgressEntry::default());
            }
            FlowType::Payment => {
                progress.namada = Some(ChainProgressEntry::default());
                progress.noble = Some(ChainProgressEntry::default());
                progress.evm = Some(ChainProgressEntry::default());
            }
        }
        progress
    }

    /// Borrow the entry for a chain key, if present.
    pub fn get(&self, key: ChainKey) -> Option<&ChainProgressEntry> {
        match key {
            ChainKey::Evm => self.evm.as_ref(),
            ChainKey::Noble => self.noble.as_ref(),
            ChainKey::Namada => self.namada.as_ref(),
        }
    }

    /// Mutably borrow the entry for a chain key, creating it when absent.
    pub fn entry_mut(&mut self, key: ChainKey) -> &mut ChainProgressEntry {
        let slot = match key {
            ChainKey::Evm => &mut self.evm,
            ChainKey::Noble => &mut self.noble,
            ChainKey::Namada => &mut self.namada,
        };
        slot.get_or_insert_with(ChainProgressEntry::default)
    }
}

/// Description of the last terminal error recorded on a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorState {
    /// Machine-readable reason, e.g. `timeout`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Error message for non-timeout failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stage group that was active when the error hit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Stage budget in milliseconds (timeouts only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Elapsed wall-clock in milliseconds (timeouts only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// When the error was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl ErrorState {
    /// A stage-timeout error state.
    pub fn timeout(stage: &str, timeout_ms: u64, elapsed_ms: u64) -> Self {
        Self {
            reason: Some("timeout".to_owned()),
            error: None,
            stage: Some(stage.to_owned()),
            timeout_ms: Some(timeout_ms),
            elapsed_ms: Some(elapsed_ms),
            occurred_at: Utc::now(),
        }
    }

    /// A generic failure error state.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            reason: None,
            error: Some(error.into()),
            stage: None,
            timeout_ms: None,
            elapsed_ms: None,
            occurred_at: Utc::now(),
        }
    }
}

/// One tracked cross-chain transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Opaque unique id.
    pub id: Uuid,
    /// Initiating transaction hash; globally unique when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Deposit or payment.
    pub flow_type: FlowType,
    /// Chain id the flow starts on.
    pub initial_chain: String,
    /// Chain id the flow ends on.
    pub destination_chain: String,
    /// Overall status.
    pub status: FlowStatus,
    /// Per-chain progress.
    pub chain_progress: ChainProgress,
    /// Free-form matching parameters supplied at registration.
    pub metadata: Map<String, Value>,
    /// Last terminal error, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_state: Option<ErrorState>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Fields required to register a new flow.
#[derive(Debug, Clone)]
pub struct NewFlow {
    /// Deposit or payment.
    pub flow_type: FlowType,
    /// Chain id the flow starts on.
    pub initial_chain: String,
    /// Chain id the flow ends on.
    pub destination_chain: String,
    /// Initiating transaction hash, unique across flows when present.
    pub tx_hash: Option<String>,
    /// Free-form matching parameters.
    pub metadata: Map<String, Value>,
    /// Pre-seeded progress (e.g. client-known stages); defaults per flow type.
    pub chain_progress: Option<ChainProgress>,
}

/// Append-only audit row for one stage change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusLogRow {
    /// Row id, ascending with insertion order.
    pub id: i64,
    /// Flow this row belongs to.
    pub flow_id: Uuid,
    /// Stage symbol, e.g. `noble_cctp_minted` or `noble_deposit_timeout`.
    pub stage: String,
    /// Chain key the change happened on.
    pub chain: ChainKey,
    /// Poller- or client-sourced.
    pub source: StageSource,
    /// Structured detail (status, message, tx hash, block, ...).
    pub detail: Value,
    /// Insertion time; rows are returned ordered ascending by this.
    pub created_at: DateTime<Utc>,
}

/// A status-log row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewStatusLog {
    /// Flow this row belongs to.
    pub flow_id: Uuid,
    /// Stage symbol.
    pub stage: String,
    /// Chain key.
    pub chain: ChainKey,
    /// Poller- or client-sourced.
    pub source: StageSource,
    /// Structured detail.
    pub detail: Value,
}

impl NewStatusLog {
    /// Build a log row for a stage entry appended to a flow.
    pub fn for_stage(flow_id: Uuid, chain: ChainKey, stage: &Stage) -> Self {
        let mut detail = Map::new();
        detail.insert("status".into(), Value::String(stage.status.as_str().into()));
        if let Some(msg) = &stage.message {
            detail.insert("message".into(), Value::String(msg.clone()));
        }
        if let Some(hash) = &stage.tx_hash {
            detail.insert("txHash".into(), Value::String(hash.clone()));
        }
        Self {
            flow_id,
            stage: stage.stage.clone(),
            chain,
            source: stage.source,
            detail: Value::Object(detail),
        }
    }
}

/// Real-time status event published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// Flow the update belongs to.
    pub flow_id: Uuid,
    /// Chain key the update happened on.
    pub chain: ChainKey,
    /// Stage symbol.
    pub stage: String,
    /// Stage status.
    pub status: ChainStatus,
    /// Optional message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional transaction hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// When the underlying event occurred.
    pub occurred_at: DateTime<Utc>,
    /// Poller- or client-sourced.
    pub source: StageSource,
    /// Free-form extra data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl StatusUpdate {
    /// Build an update mirroring a stage entry.
    pub fn from_stage(flow_id: Uuid, chain: ChainKey, stage: &Stage) -> Self {
        Self {
            flow_id,
            chain,
            stage: stage.stage.clone(),
            status: stage.status,
            message: stage.message.clone(),
            tx_hash: stage.tx_hash.clone(),
            occurred_at: stage.occurred_at,
            source: stage.source,
            metadata: stage.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!FlowStatus::Pending.is_terminal());
        assert!(FlowStatus::Completed.is_terminal());
        assert!(FlowStatus::Failed.is_terminal());
        assert!(FlowStatus::Undetermined.is_terminal());
    }

    #[test]
    fn initial_progress_key_sets() {
        let deposit = ChainProgress::initial(FlowType::Deposit);
        assert!(deposit.evm.is_none());
        assert!(deposit.noble.is_some());
        assert!(deposit.namada.is_some());

        let payment = ChainProgress::initial(FlowType::Payment);
        assert!(payment.evm.is_some());
        assert!(payment.noble.is_some());
        assert!(payment.namada.is_some());
    }

    #[test]
    fn chain_progress_serializes_camel_case() {
        let mut progress = ChainProgress::initial(FlowType::Deposit);
        let entry = progress.entry_mut(ChainKey::Noble);
        entry.start_block = Some(42_569_560);
        entry.stages.push(Stage::confirmed("noble_cctp_minted", None));

        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["noble"]["startBlock"], 42_569_560);
        assert_eq!(json["noble"]["stages"][0]["stage"], "noble_cctp_minted");
        assert_eq!(json["noble"]["stages"][0]["status"], "confirmed");
        // Empty gasless stage lists stay off the wire.
        assert!(json["noble"].get("gaslessStages").is_none());
    }

    #[test]
    fn entry_mut_creates_missing_entries() {
        let mut progress = ChainProgress::initial(FlowType::Deposit);
        assert!(progress.evm.is_none());
        progress.entry_mut(ChainKey::Evm).status = ChainStatus::Confirmed;
        assert_eq!(progress.evm.unwrap().status, ChainStatus::Confirmed);
    }
}
