use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crossflow_core::{BlockResults, ChainResult, PollParams, PollResult, TendermintProvider};

/// Scan blocks from `params.start_block` until the visitor reports a match,
/// the deadline passes, or the poll is cancelled.
///
/// Per the scanning protocol: the tip is re-read whenever the scan catches
/// up; a height that errors is logged and skipped rather than stalling the
/// scan (transient errors have already been retried by the adapter); a
/// not-yet-available height waits for the next tip poll. Latching state lives
/// in the visitor closure, which keeps the pollers themselves stateless.
pub async fn scan_blocks<F>(
    provider: &dyn TendermintProvider,
    params: &PollParams,
    mut visit: F,
) -> ChainResult<PollResult>
where
    F: FnMut(u64, &BlockResults) -> Option<PollResult>,
{
    let deadline = Instant::now() + params.timeout;
    let mut next_height = params.start_block;

    loop {
        if params.cancel.is_cancelled() || Instant::now() >= deadline {
            return Ok(PollResult::unmatched());
        }

        let tip = match provider.latest_block_height().await {
            Ok(tip) => tip,
            Err(err) => {
                warn!(chain = %params.chain_id, error = %err, "failed to read tip, retrying next interval");
                idle(params, deadline).await;
                continue;
            }
        };

        while next_height <= tip {
            if params.cancel.is_cancelled() || Instant::now() >= deadline {
                return Ok(PollResult::unmatched());
            }

            match provider.block_results(next_height).await {
                Ok(Some(block)) => {
                    if let Some(result) = visit(next_height, &block) {
                        return Ok(result);
                    }
                }
                Ok(None) => {
                    // The node's tip raced ahead of result availability; try
                    // again on the next tip poll without advancing.
                    debug!(chain = %params.chain_id, height = next_height, "block results not yet available");
                    break;
                }
                Err(err) if err.is_transient() => {
                    warn!(chain = %params.chain_id, height = next_height, error = %err, "transient block fetch failure, advancing");
                }
                Err(err) => {
                    debug!(chain = %params.chain_id, height = next_height, error = %err, "skipping height after permanent failure");
                }
            }
            next_height += 1;

            if !params.block_request_delay.is_zero() {
                sleep(params.block_request_delay).await;
            }
        }

        idle(params, deadline).await;
    }
}

/// Sleep one poll interval bounded by the deadline, waking on cancellation.
async fn idle(params: &PollParams, deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let nap = params.poll_interval.min(remaining.max(Duration::from_millis(1)));
    tokio::select! {
        _ = params.cancel.cancelled() => {}
        _ = sleep(nap) => {}
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossflow_test::MockTendermintProvider;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;

    fn poll_params(start: u64, timeout_ms: u64) -> PollParams {
        PollParams {
            flow_id: Uuid::new_v4(),
            chain_id: "noble-testnet".into(),
            start_block: start,
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(5),
            block_request_delay: Duration::ZERO,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn visits_every_height_up_to_tip() {
        let provider = MockTendermintProvider::new(105);
        for h in 100..=105 {
            provider.add_block(h, BlockResults { height: h, ..Default::default() });
        }

        let mut seen = Vec::new();
        let result = scan_blocks(&provider, &poll_params(100, 40), |height, _| {
            seen.push(height);
            None
        })
        .await
        .unwrap();

        assert!(!result.matched);
        assert_eq!(seen, vec![100, 101, 102, 103, 104, 105]);
    }

    #[tokio::test]
    async fn stops_on_first_match() {
        let provider = MockTendermintProvider::new(105);
        for h in 100..=105 {
            provider.add_block(h, BlockResults { height: h, ..Default::default() });
        }

        let result = scan_blocks(&provider, &poll_params(100, 1_000), |height, _| {
            (height == 102).then(|| PollResult::matched(None, height))
        })
        .await
        .unwrap();

        assert!(result.matched);
        assert_eq!(result.block, Some(102));
    }

    #[tokio::test]
    async fn missing_heights_are_skipped() {
        let provider = MockTendermintProvider::new(103);
        provider.add_block(100, BlockResults { height: 100, ..Default::default() });
        // 101 errors permanently (registered as failing), 102..=103 present.
        provider.fail_block(101);
        provider.add_block(102, BlockResults { height: 102, ..Default::default() });
        provider.add_block(103, BlockResults { height: 103, ..Default::default() });

        let mut seen = Vec::new();
        let _ = scan_blocks(&provider, &poll_params(100, 40), |height, _| {
            seen.push(height);
            None
        })
        .await
        .unwrap();

        assert_eq!(seen, vec![100, 102, 103]);
    }

    #[tokio::test]
    async fn cancellation_ends_the_scan() {
        let provider = MockTendermintProvider::new(105);
        let params = poll_params(100, 60_000);
        params.cancel.cancel();

        let result = scan_blocks(&provider, &params, |_, _| None).await.unwrap();
        assert!(!result.matched);
    }
}
