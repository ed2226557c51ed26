use tracing::{debug, instrument};

use crossflow_core::{
    observe, stages, AbciEvent, ChainResult, PollParams, PollResult, StageObservation,
    StageObserver, TendermintProvider,
};

use crate::events::{decode_packet_data, strip_quotes, PacketData, IBC_ACK_SUCCESS};
use crate::scan::scan_blocks;

/// What the Noble deposit poller watches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NobleDepositWatch {
    /// Forwarding address the CCTP mint lands on.
    pub forwarding_address: String,
    /// Namada receiver of the IBC forward.
    pub namada_receiver: String,
    /// Exact Cosmos amount string, e.g. `100000uusdc`.
    pub expected_amount_uusdc: String,
}

/// Watch Noble for an EVM→Namada deposit: a CCTP mint on the forwarding
/// account (`coin_received`) and the follow-up IBC forward (`ibc_transfer`).
///
/// The two conditions may land in the same or different heights; each latches
/// independently and is reported through the observer as it fires. The poll
/// succeeds once both have latched.
#[instrument(level = "debug", skip_all, fields(flow_id = %params.flow_id, chain = %params.chain_id))]
pub async fn poll_for_deposit(
    provider: &dyn TendermintProvider,
    params: &PollParams,
    watch: &NobleDepositWatch,
    observer: Option<&StageObserver>,
) -> ChainResult<PollResult> {
    let mut minted = false;
    let mut forwarded = false;

    scan_blocks(provider, params, |height, block| {
        if !minted {
            let hit = block
                .txs_results
                .iter()
                .filter(|tx| tx.succeeded())
                .flat_map(|tx| tx.events.iter())
                .any(|event| coin_received_matches(event, watch));
            if hit {
                minted = true;
                debug!(height, "coin_received matched forwarding account");
                observe(
                    observer,
                    StageObservation {
                        stage: stages::NOBLE_CCTP_MINTED,
                        tx_hash: None,
                        block: Some(height),
                    },
                );
            }
        }

        if !forwarded {
            let hit = block
                .finalize_block_events
                .iter()
                .any(|event| ibc_transfer_matches(event, watch));
            if hit {
                forwarded = true;
                debug!(height, "ibc_transfer matched forward to namada");
                observe(
                    observer,
                    StageObservation {
                        stage: stages::NOBLE_IBC_FORWARDED,
                        tx_hash: None,
                        block: Some(height),
                    },
                );
            }
        }

        (minted && forwarded).then(|| PollResult::matched(None, height))
    })
    .await
}

fn coin_received_matches(event: &AbciEvent, watch: &NobleDepositWatch) -> bool {
    event.kind == "coin_received"
        && event.attr("receiver").as_deref() == Some(watch.forwarding_address.as_str())
        && event.attr("amount").as_deref() == Some(watch.expected_amount_uusdc.as_str())
}

fn ibc_transfer_matches(event: &AbciEvent, watch: &NobleDepositWatch) -> bool {
    event.kind == "ibc_transfer"
        && event.attr("sender").as_deref() == Some(watch.forwarding_address.as_str())
        && event.attr("receiver").as_deref() == Some(watch.namada_receiver.as_str())
        && event.attr("denom").as_deref() == Some("uusdc")
}

/// What the orbiter poller watches for on a Namada→EVM payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrbiterWatch {
    /// Exact memo JSON carried by the inbound IBC packet.
    pub memo_json: String,
    /// Amount in base units (uusdc digits).
    pub amount: String,
    /// Noble orbiter/forwarding address receiving the packet.
    pub receiver: String,
    /// Base64 CCTP destination caller.
    pub destination_caller_b64: String,
    /// Base64 CCTP mint recipient.
    pub mint_recipient_b64: String,
    /// CCTP destination domain id.
    pub destination_domain: u32,
}

/// Watch Noble for the payment leg: the acknowledged inbound IBC packet from
/// Namada and the CCTP burn towards the EVM destination.
///
/// Both conditions are transactional events; they latch independently and are
/// reported through the observer, and the poll succeeds once both fired.
#[instrument(level = "debug", skip_all, fields(flow_id = %params.flow_id, chain = %params.chain_id))]
pub async fn poll_for_orbiter(
    provider: &dyn TendermintProvider,
    params: &PollParams,
    watch: &OrbiterWatch,
    observer: Option<&StageObserver>,
) -> ChainResult<PollResult> {
    let mut received = false;
    let mut burned = false;

    scan_blocks(provider, params, |height, block| {
        let events = block
            .txs_results
            .iter()
            .filter(|tx| tx.succeeded())
            .flat_map(|tx| tx.events.iter());

        for event in events {
            if !received && write_ack_matches(event, watch) {
                received = true;
                debug!(height, "write_acknowledgement matched inbound packet");
                observe(
                    observer,
                    StageObservation {
                        stage: stages::NOBLE_IBC_RECEIVED,
                        tx_hash: None,
                        block: Some(height),
                    },
                );
            }
            if !burned && deposit_for_burn_matches(event, watch) {
                burned = true;
                debug!(height, "DepositForBurn matched cctp parameters");
                observe(
                    observer,
                    StageObservation {
                        stage: stages::NOBLE_CCTP_BURNED,
                        tx_hash: None,
                        block: Some(height),
                    },
                );
            }
        }

        (received && burned).then(|| PollResult::matched(None, height))
    })
    .await
}

fn write_ack_matches(event: &AbciEvent, watch: &OrbiterWatch) -> bool {
    if event.kind != "write_acknowledgement" {
        return false;
    }
    let ack_ok = event
        .attr("packet_ack")
        .map(|ack| strip_quotes(&ack) == IBC_ACK_SUCCESS || ack == IBC_ACK_SUCCESS)
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
    packet.memo.as_deref() == Some(watch.memo_json.as_str())
        && packet.amount == watch.amount
        && packet.receiver == watch.receiver
}

fn deposit_for_burn_matches(event: &AbciEvent, watch: &OrbiterWatch) -> bool {
    if event.kind != "circle.cctp.v1.DepositForBurn" {
        return false;
    }
    let attr = |key: &str| event.attr(key).map(|v| strip_quotes(&v).to_owned());
    attr("amount").as_deref() == Some(watch.amount.as_str())
        && attr("destination_caller").as_deref() == Some(watch.destination_caller_b64.as_str())
        && attr("mint_recipient").as_deref() == Some(watch.mint_recipient_b64.as_str())
        && attr("destination_domain").as_deref() == Some(watch.destination_domain.to_string().as_str())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossflow_core::{BlockResults, EventAttribute, TxResult};
    use crossflow_test::MockTendermintProvider;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;

    const FORWARDING: &str = "noble1cugfxuln9k2zsvey7yuaeckr7avfzffd7d44jp";
    const NAMADA_RECEIVER: &str = "tnam1qprxs9n5afscskramwajyrdjw5a64lwweudc0l78";

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

    fn deposit_watch() -> NobleDepositWatch {
        NobleDepositWatch {
            forwarding_address: FORWARDING.into(),
            namada_receiver: NAMADA_RECEIVER.into(),
            expected_amount_uusdc: "100000uusdc".into(),
        }
    }

    fn event(kind: &str, attrs: &[(&str, &str)]) -> AbciEvent {
        AbciEvent {
            kind: kind.into(),
            attributes: attrs
                .iter()
                .map(|(k, v)| EventAttribute {
                    key: (*k).into(),
                    value: (*v).into(),
                })
                .collect(),
        }
    }

    fn deposit_block(height: u64, amount: &str) -> BlockResults {
        BlockResults {
            height,
            txs_results: vec![TxResult {
                code: 0,
                events: vec![event(
                    "coin_received",
                    &[("receiver", FORWARDING), ("amount", amount)],
                )],
            }],
            finalize_block_events: vec![event(
                "ibc_transfer",
                &[
                    ("sender", FORWARDING),
                    ("receiver", NAMADA_RECEIVER),
                    ("denom", "uusdc"),
                ],
            )],
            end_block_events: vec![],
        }
    }

    #[tokio::test]
    async fn deposit_matches_when_both_conditions_land_in_one_block() {
        let provider = MockTendermintProvider::new(42_569_565);
        provider.add_block(42_569_565, deposit_block(42_569_565, "100000uusdc"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = poll_for_deposit(
            &provider,
            &poll_params(42_569_565, 1_000),
            &deposit_watch(),
            Some(&tx),
        )
        .await
        .unwrap();

        assert!(result.matched);
        assert_eq!(result.block, Some(42_569_565));
        assert_eq!(rx.recv().await.unwrap().stage, stages::NOBLE_CCTP_MINTED);
        assert_eq!(rx.recv().await.unwrap().stage, stages::NOBLE_IBC_FORWARDED);
    }

    #[tokio::test]
    async fn deposit_latches_across_heights() {
        let provider = MockTendermintProvider::new(101);
        // coin_received at 100, ibc_transfer only at 101.
        let mut first = deposit_block(100, "100000uusdc");
        first.finalize_block_events.clear();
        provider.add_block(100, first);
        let mut second = deposit_block(101, "100000uusdc");
        second.txs_results.clear();
        provider.add_block(101, second);

        let result = poll_for_deposit(
            &provider,
            &poll_params(100, 1_000),
            &deposit_watch(),
            None,
        )
        .await
        .unwrap();

        assert!(result.matched);
        assert_eq!(result.block, Some(101));
    }

    #[tokio::test]
    async fn deposit_rejects_wrong_amount() {
        let provider = MockTendermintProvider::new(100);
        provider.add_block(100, deposit_block(100, "99999uusdc"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = poll_for_deposit(
            &provider,
            &poll_params(100, 40),
            &deposit_watch(),
            Some(&tx),
        )
        .await
        .unwrap();

        assert!(!result.matched);
        // The forward alone latched; no mint observation was reported.
        assert_eq!(rx.recv().await.unwrap().stage, stages::NOBLE_IBC_FORWARDED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deposit_ignores_failed_txs() {
        let provider = MockTendermintProvider::new(100);
        let mut block = deposit_block(100, "100000uusdc");
        block.txs_results[0].code = 11;
        provider.add_block(100, block);

        let result =
            poll_for_deposit(&provider, &poll_params(100, 40), &deposit_watch(), None)
                .await
                .unwrap();
        assert!(!result.matched);
    }

    fn orbiter_watch() -> OrbiterWatch {
        OrbiterWatch {
            memo_json: r#"{"dest":"0"}"#.into(),
            amount: "250000".into(),
            receiver: FORWARDING.into(),
            destination_caller_b64: "AAAA".into(),
            mint_recipient_b64: "BBBB".into(),
            destination_domain: 0,
        }
    }

    fn orbiter_block(height: u64) -> BlockResults {
        let packet = format!(
            r#"{{"sender":"tnam1sender","receiver":"{FORWARDING}","denom":"transfer/channel-99/uusdc","amount":"250000","memo":"{}"}}"#,
            r#"{\"dest\":\"0\"}"#,
        );
        BlockResults {
            height,
            txs_results: vec![
                TxResult {
                    code: 0,
                    events: vec![event(
                        "write_acknowledgement",
                        &[("packet_ack", IBC_ACK_SUCCESS), ("packet_data", &packet)],
                    )],
                },
                TxResult {
                    code: 0,
                    events: vec![event(
                        "circle.cctp.v1.DepositForBurn",
                        &[
                            ("amount", "\"250000\""),
                            ("destination_caller", "\"AAAA\""),
                            ("mint_recipient", "\"BBBB\""),
                            ("destination_domain", "0"),
                        ],
                    )],
                },
            ],
            finalize_block_events: vec![],
            end_block_events: vec![],
        }
    }

    #[tokio::test]
    async fn orbiter_matches_ack_and_burn() {
        let provider = MockTendermintProvider::new(200);
        provider.add_block(200, orbiter_block(200));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = poll_for_orbiter(
            &provider,
            &poll_params(200, 1_000),
            &orbiter_watch(),
            Some(&tx),
        )
        .await
        .unwrap();

        assert!(result.matched);
        assert_eq!(rx.recv().await.unwrap().stage, stages::NOBLE_IBC_RECEIVED);
        assert_eq!(rx.recv().await.unwrap().stage, stages::NOBLE_CCTP_BURNED);
    }

    #[tokio::test]
    async fn orbiter_rejects_memo_mismatch() {
        let provider = MockTendermintProvider::new(200);
        provider.add_block(200, orbiter_block(200));

        let mut watch = orbiter_watch();
        watch.memo_json = r#"{"dest":"7"}"#.into();

        let result = poll_for_orbiter(&provider, &poll_params(200, 40), &watch, None)
            .await
            .unwrap();
        assert!(!result.matched);
    }
}
