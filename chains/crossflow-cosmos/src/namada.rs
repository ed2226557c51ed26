use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

use crossflow_core::{
    AbciEvent, BlockResults, ChainResult, PollParams, PollResult, TendermintProvider,
};

use crate::events::{amounts_equal_uusdc, decode_packet_data, PacketData, IBC_ACK_SUCCESS};
use crate::scan::scan_blocks;

/// What the Namada deposit poller watches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamadaDepositWatch {
    /// Noble forwarding address that sent the IBC transfer.
    pub forwarding_address: String,
    /// Namada receiver being credited.
    pub namada_receiver: String,
    /// Expected amount; the `uusdc` suffix is optional on either side.
    pub expected_amount_uusdc: String,
}

/// Watch Namada for the acknowledged arrival of a deposit.
///
/// Namada surfaces block events under `end_block_events`, and the inner
/// transaction hash travels in a separate `message` event rather than as an
/// attribute of `write_acknowledgement`. Each block is therefore read in two
/// passes: first the `message` event for `inner-tx-hash`, then the
/// acknowledgement whose packet must match sender, receiver, denom and
/// amount.
#[instrument(level = "debug", skip_all, fields(flow_id = %params.flow_id, chain = %params.chain_id))]
pub async fn poll_for_deposit(
    provider: &dyn TendermintProvider,
    params: &PollParams,
    watch: &NamadaDepositWatch,
) -> ChainResult<PollResult> {
    scan_blocks(provider, params, |height, block| {
        visit_block(height, block, watch)
    })
    .await
}

fn visit_block(height: u64, block: &BlockResults, watch: &NamadaDepositWatch) -> Option<PollResult> {
    // Pass one: the inner tx hash announced alongside the acknowledgement.
    let inner_tx_hash = block
        .end_block_events
        .iter()
        .filter(|event| event.kind == "message")
        .find_map(|event| event.attr("inner-tx-hash"));

    // Pass two: the acknowledgement itself.
    let acked = block
        .end_block_events
        .iter()
        .filter(|event| event.kind == "write_acknowledgement")
        .any(|event| write_ack_matches(event, watch));

    if !acked {
        return None;
    }
    if inner_tx_hash.is_none() {
        debug!(height, "acknowledgement matched but no message event carried inner-tx-hash");
    }
    Some(PollResult::matched(inner_tx_hash, height))
}

fn write_ack_matches(event: &AbciEvent, watch: &NamadaDepositWatch) -> bool {
    let ack_ok = event
        .attr("packet_ack")
        .map(|ack| ack == IBC_ACK_SUCCESS)
        .unwrap_or(false);
    if !ack_ok {
        return false;
    }
    let Some(raw) = event.attr("packet_data") else {
        return false;
    };
    let Some(packet) = decode_packet_data(&raw).as_ref().and_then(PacketData::from_json) else {
        debug!("write_acknowledgement with undecodable packet_data");
        return false;
    };
    packet.sender == watch.forwarding_address
        && packet.receiver == watch.namada_receiver
        && packet.denom == "uusdc"
        && amounts_equal_uusdc(&packet.amount, &watch.expected_amount_uusdc)
}

/// Confirm a client-supplied Namada IBC transaction by hash lookup.
///
/// Used for the payment flow's first leg, where the initiating shielded
/// transaction is only observable through its IBC envelope.
#[instrument(level = "debug", skip_all, fields(flow_id = %params.flow_id, tx = %tx_hash))]
pub async fn confirm_ibc_send(
    provider: &dyn TendermintProvider,
    params: &PollParams,
    tx_hash: &str,
) -> ChainResult<PollResult> {
    let deadline = Instant::now() + params.timeout;
    loop {
        if params.cancel.is_cancelled() || Instant::now() >= deadline {
            return Ok(PollResult::unmatched());
        }

        match provider.transaction(tx_hash).await {
            Ok(Some(tx)) if tx.tx_result.succeeded() => {
                return Ok(PollResult::matched(Some(tx.hash), tx.height));
            }
            Ok(Some(tx)) => {
                warn!(code = tx.tx_result.code, "namada ibc transaction failed on chain");
                return Ok(PollResult::unmatched());
            }
            Ok(None) => debug!("namada ibc transaction not yet found"),
            Err(err) => warn!(error = %err, "namada tx lookup failed, retrying next interval"),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let nap = params.poll_interval.min(remaining.max(Duration::from_millis(1)));
        tokio::select! {
            _ = params.cancel.cancelled() => {}
            _ = sleep(nap) => {}
        }
    }
}
