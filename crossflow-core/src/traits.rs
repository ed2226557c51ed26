use async_trait::async_trait;
use ethers_core::types::{H160, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    BlockResults, ChainKey, ChainResult, ChainStatus, ErrorState, Flow, FlowStatus, NewFlow,
    NewStatusLog, Stage, StatusLogRow, StatusUpdate, StoreResult, TxLookup, TxSearch,
};

/// Read interface over an EVM JSON-RPC endpoint.
#[async_trait]
pub trait EvmProvider: Send + Sync {
    /// Current chain head height.
    async fn block_number(&self) -> ChainResult<u64>;

    /// Logs matching the filter, inclusive block range.
    async fn logs(&self, query: &LogQuery) -> ChainResult<Vec<EvmLog>>;

    /// Transaction by hash; `None` when not yet known.
    async fn transaction(&self, hash: H256) -> ChainResult<Option<EvmTransaction>>;

    /// Receipt by hash; `None` while the tx is unmined.
    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<EvmReceipt>>;
}

/// An `eth_getLogs` filter: block range, contract, up to three indexed topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// First block, inclusive.
    pub from_block: u64,
    /// Last block, inclusive.
    pub to_block: u64,
    /// Emitting contract.
    pub address: H160,
    /// Indexed topic filters; `None` matches anything.
    pub topics: [Option<H256>; 3],
}

/// One matched EVM log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmLog {
    /// Emitting contract.
    pub address: H160,
    /// Indexed topics.
    pub topics: Vec<H256>,
    /// ABI-encoded payload; event values are 32-byte big-endian words.
    pub data: Vec<u8>,
    /// Block the log landed in.
    pub block_number: u64,
    /// Transaction that emitted the log.
    pub transaction_hash: H256,
}

impl EvmLog {
    /// Interpret a single-word data payload as a big-endian integer.
    pub fn data_as_u256(&self) -> Option<U256> {
        (self.data.len() == 32).then(|| U256::from_big_endian(&self.data))
    }
}

/// Minimal view of an EVM transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmTransaction {
    /// Transaction hash.
    pub hash: H256,
    /// Inclusion height, `None` while pending.
    pub block_number: Option<u64>,
}

/// Minimal view of an EVM transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmReceipt {
    /// Transaction hash.
    pub transaction_hash: H256,
    /// Inclusion height.
    pub block_number: Option<u64>,
    /// Post-Byzantium status flag: 1 success, 0 revert.
    pub status: Option<u64>,
}

/// Read interface over a Tendermint RPC endpoint.
#[async_trait]
pub trait TendermintProvider: Send + Sync {
    /// Latest committed block height.
    async fn latest_block_height(&self) -> ChainResult<u64>;

    /// Block execution results; `None` when the height is not yet available.
    async fn block_results(&self, height: u64) -> ChainResult<Option<BlockResults>>;

    /// Transaction by hex hash; `None` when unknown.
    async fn transaction(&self, hash: &str) -> ChainResult<Option<TxLookup>>;

    /// Paged transaction search with a Tendermint query expression.
    async fn search_transactions(
        &self,
        query: &str,
        page: u32,
        per_page: u8,
    ) -> ChainResult<TxSearch>;
}

/// Outcome of an idempotent flow registration.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A new flow row was inserted.
    Created(Flow),
    /// A flow with the same initiating tx hash already existed.
    Existing(Flow),
}

impl CreateOutcome {
    /// The flow, regardless of whether it was just created.
    pub fn into_flow(self) -> Flow {
        match self {
            CreateOutcome::Created(flow) | CreateOutcome::Existing(flow) => flow,
        }
    }

    /// Whether a new row was inserted.
    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Outcome of a guarded terminal-status write.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusWrite {
    /// The status was applied; the updated flow is returned.
    Applied(Flow),
    /// The flow already carried a terminal status; nothing was written.
    AlreadyTerminal(FlowStatus),
}

/// Durable store for flows and their status logs.
///
/// Implementations enforce the invariants the rest of the system relies on:
/// the terminal-status lattice (`set_status_if_pending`), write-once start
/// blocks (`ensure_start_block`) and append-only stages.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Register a flow; idempotent on the initiating tx hash.
    async fn create_flow(&self, new: NewFlow) -> StoreResult<CreateOutcome>;

    /// Flow by id.
    async fn flow(&self, id: Uuid) -> StoreResult<Option<Flow>>;

    /// Flow by initiating tx hash.
    async fn flow_by_tx_hash(&self, tx_hash: &str) -> StoreResult<Option<Flow>>;

    /// Flow by any chain-specific tx hash (initiating hash, chain entry hash
    /// or stage hash), terminal flows included.
    async fn flow_by_any_hash(&self, chain: ChainKey, tx_hash: &str) -> StoreResult<Option<Flow>>;

    /// All flows whose status is non-terminal.
    async fn list_unfinished(&self) -> StoreResult<Vec<Flow>>;

    /// Resolve the scan start height for `(flow, chain)`, writing `computed`
    /// only when no start block was persisted before. Returns the effective
    /// value either way.
    async fn ensure_start_block(
        &self,
        id: Uuid,
        chain: ChainKey,
        computed: u64,
    ) -> StoreResult<u64>;

    /// Append a poller stage to a chain entry without touching the
    /// chain-level status.
    async fn append_stage(&self, id: Uuid, chain: ChainKey, stage: Stage) -> StoreResult<Flow>;

    /// Append a client-reported stage; `gasless` routes it to the auxiliary
    /// list.
    async fn append_client_stage(
        &self,
        id: Uuid,
        chain: ChainKey,
        stage: Stage,
        gasless: bool,
    ) -> StoreResult<Flow>;

    /// Mark a chain entry confirmed/failed, stamping `last_checked_at` and
    /// optionally the confirming tx hash.
    async fn set_chain_status(
        &self,
        id: Uuid,
        chain: ChainKey,
        status: ChainStatus,
        tx_hash: Option<String>,
    ) -> StoreResult<Flow>;

    /// Write a terminal status unless the flow is already terminal.
    async fn set_status_if_pending(
        &self,
        id: Uuid,
        status: FlowStatus,
        error: Option<ErrorState>,
    ) -> StoreResult<StatusWrite>;

    /// Append one audit row.
    async fn append_status_log(&self, row: NewStatusLog) -> StoreResult<()>;

    /// All audit rows for a flow, ordered ascending by creation time.
    async fn status_logs(&self, id: Uuid) -> StoreResult<Vec<StatusLogRow>>;
}

/// In-process fan-out for real-time status updates.
///
/// Delivery is best-effort and at-most-once per subscriber; consumers that
/// miss events reconcile by re-reading flow status.
pub trait StatusEvents: Send + Sync {
    /// Publish an update to whoever is subscribed to its flow.
    fn publish(&self, update: StatusUpdate);
}
