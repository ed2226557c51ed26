use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{ChainResult, ChainRpcError};

/// Exponential backoff policy for transient chain RPC faults.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (zero-based): 500ms, 1s, 2s, ...
    /// capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry));
        exp.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Permanent errors return immediately; transient errors sleep per the policy
/// and try again. The last transient error is returned when attempts run out.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> ChainResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChainResult<T>>,
{
    let mut last_err: Option<ChainRpcError> = None;
    for attempt in 0..policy.attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                let backoff = policy.backoff(attempt);
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "transient rpc fault");
                last_err = Some(err);
                if attempt + 1 < policy.attempts {
                    sleep(backoff).await;
                }
            }
            Err(err) => {
                warn!(error = %err, "permanent rpc fault, not retrying");
                return Err(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ChainRpcError::Transport("retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(5), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(RetryPolicy::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ChainRpcError::HttpStatus(503))
                } else {
                    Ok(42u64)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_fault_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: ChainResult<u64> = with_retry(RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChainRpcError::HttpStatus(404)) }
        })
        .await;
        assert!(matches!(result, Err(ChainRpcError::HttpStatus(404))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_error() {
        let result: ChainResult<u64> = with_retry(RetryPolicy::default(), || async {
            Err(ChainRpcError::HttpStatus(429))
        })
        .await;
        assert!(matches!(result, Err(ChainRpcError::HttpStatus(429))));
    }
}
