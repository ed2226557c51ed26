use std::time::Duration;

use ethers_core::types::{H160, H256, U256};
use ethers_core::utils::keccak256;
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

use crossflow_core::{ChainResult, EvmProvider, LogQuery, PollParams, PollResult};

/// `keccak("Transfer(address,address,uint256)")`, topic0 of ERC-20 transfers.
pub fn transfer_topic() -> H256 {
    H256::from(keccak256(b"Transfer(address,address,uint256)"))
}

/// Left-pad an address into a 32-byte indexed topic.
pub fn address_topic(address: H160) -> H256 {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    H256::from(word)
}

/// What the mint poller watches for: a zero-address ERC-20 Transfer of an
/// exact amount to a known recipient on a known token contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintWatch {
    /// USDC token contract.
    pub usdc: H160,
    /// Mint recipient.
    pub recipient: H160,
    /// Expected value in base units, compared for exact equality.
    pub amount: U256,
}

/// Watch for a USDC mint: Transfer from `0x0` to the recipient with the
/// exact expected amount. Returns the matching tx hash and block.
#[instrument(level = "debug", skip_all, fields(flow_id = %params.flow_id, chain = %params.chain_id))]
pub async fn poll_usdc_mint(
    provider: &dyn EvmProvider,
    params: &PollParams,
    watch: &MintWatch,
) -> ChainResult<PollResult> {
    let deadline = Instant::now() + params.timeout;
    let mut from = params.start_block;
    let topics = [
        Some(transfer_topic()),
        Some(address_topic(H160::zero())),
        Some(address_topic(watch.recipient)),
    ];

    loop {
        if params.cancel.is_cancelled() || Instant::now() >= deadline {
            return Ok(PollResult::unmatched());
        }

        let tip = match provider.block_number().await {
            Ok(tip) => tip,
            Err(err) => {
                warn!(error = %err, "failed to read evm tip, retrying next interval");
                idle(params, deadline).await;
                continue;
            }
        };

        if tip >= from {
            let query = LogQuery {
                from_block: from,
                to_block: tip,
                address: watch.usdc,
                topics,
            };
            match provider.logs(&query).await {
                Ok(logs) => {
                    for log in logs {
                        match log.data_as_u256() {
                            Some(value) if value == watch.amount => {
                                return Ok(PollResult::matched(
                                    Some(format!("{:?}", log.transaction_hash)),
                                    log.block_number,
                                ));
                            }
                            Some(value) => {
                                debug!(%value, expected = %watch.amount, block = log.block_number, "transfer amount mismatch");
                            }
                            None => {
                                debug!(block = log.block_number, "transfer log with malformed data, skipping");
                            }
                        }
                    }
                    // Scanned ranges never repeat; the next pass starts past
                    // this tip.
                    from = tip + 1;
                }
                Err(err) if err.is_transient() => {
                    warn!(error = %err, from, to = tip, "transient getLogs failure");
                }
                Err(err) => {
                    warn!(error = %err, from, to = tip, "permanent getLogs failure, advancing past range");
                    from = tip + 1;
                }
            }
        }

        idle(params, deadline).await;
    }
}

/// Confirm the initiating burn transaction by receipt lookup. A reverted
/// receipt ends the poll without a match.
#[instrument(level = "debug", skip_all, fields(flow_id = %params.flow_id, tx = ?burn_tx))]
pub async fn poll_burn_receipt(
    provider: &dyn EvmProvider,
    params: &PollParams,
    burn_tx: H256,
) -> ChainResult<PollResult> {
    let deadline = Instant::now() + params.timeout;
    loop {
        if params.cancel.is_cancelled() || Instant::now() >= deadline {
            return Ok(PollResult::unmatched());
        }

        match provider.transaction_receipt(burn_tx).await {
            Ok(Some(receipt)) => {
                if receipt.status == Some(0) {
                    warn!(tx = ?burn_tx, "burn transaction reverted");
                    return Ok(PollResult::unmatched());
                }
                if let Some(block) = receipt.block_number {
                    return Ok(PollResult::matched(Some(format!("{burn_tx:?}")), block));
                }
            }
            Ok(None) => debug!(tx = ?burn_tx, "burn receipt not yet available"),
            Err(err) => warn!(error = %err, "receipt lookup failed, retrying next interval"),
        }

        idle(params, deadline).await;
    }
}

/// Sleep one poll interval (bounded by the deadline), waking early on
/// cancellation.
async fn idle(params: &PollParams, deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let nap = params.poll_interval.min(remaining.max(Duration::from_millis(1)));
    tokio::select! {
        _ = params.cancel.cancelled() => {}
        _ = sleep(nap) => {}
    }
}
