use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Inputs shared by every chain poller.
///
/// Pollers are stateless and reentrant: all progress they need is carried in
/// here, and cancellation is cooperative through the token.
#[derive(Debug, Clone)]
pub struct PollParams {
    /// Flow being observed, for logging.
    pub flow_id: Uuid,
    /// Chain id being scanned, for logging and metrics.
    pub chain_id: String,
    /// First height to scan.
    pub start_block: u64,
    /// Wall-clock budget for the whole poll.
    pub timeout: Duration,
    /// Sleep between tip polls when caught up.
    pub poll_interval: Duration,
    /// Sleep between consecutive block fetches.
    pub block_request_delay: Duration,
    /// Leaf of the engine → stage → RPC cancellation chain.
    pub cancel: CancellationToken,
}

/// Outcome of one poller invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    /// Whether the watched condition was observed.
    pub matched: bool,
    /// Matching transaction hash, when the chain surface exposes one.
    pub tx_hash: Option<String>,
    /// Height at which the match landed.
    pub block: Option<u64>,
}

impl PollResult {
    /// A successful match.
    pub fn matched(tx_hash: Option<String>, block: u64) -> Self {
        Self {
            matched: true,
            tx_hash,
            block: Some(block),
        }
    }

    /// No match before cancellation or deadline.
    pub fn unmatched() -> Self {
        Self {
            matched: false,
            tx_hash: None,
            block: None,
        }
    }
}

/// Intermediate observation reported by a poller while it keeps scanning.
///
/// Multi-condition pollers (the Noble deposit and orbiter watchers) latch two
/// independent events; each latch is surfaced immediately so the engine can
/// persist and fan out the stage without waiting for the other half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageObservation {
    /// Stage symbol that just latched.
    pub stage: &'static str,
    /// Transaction hash, when applicable.
    pub tx_hash: Option<String>,
    /// Height the event was found at.
    pub block: Option<u64>,
}

/// Channel end pollers push [`StageObservation`]s into.
pub type StageObserver = UnboundedSender<StageObservation>;

/// Report an observation, ignoring a hung-up engine.
pub fn observe(observer: Option<&StageObserver>, observation: StageObservation) {
    if let Some(tx) = observer {
        let _ = tx.send(observation);
    }
}
