use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use derive_new::new;
use ethers_core::types::{H160, H256, U256};
use serde_json::{json, Map};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crossflow_base::CoreMetrics;
use crossflow_core::{
    stages, ChainKey, ChainRegistry, ChainRpcError, ChainStatus, ErrorState, EvmProvider, Flow,
    FlowParams, FlowStatus, FlowStore, FlowType, NewStatusLog, PollParams, PollResult,
    PollingConfigs, Stage, StageObservation, StageSource, StatusEvents, StatusUpdate, StatusWrite,
    StoreError, TendermintProvider,
};
use crossflow_cosmos::namada::{self, NamadaDepositWatch};
use crossflow_cosmos::noble::{self, NobleDepositWatch, OrbiterWatch};
use crossflow_ethereum::MintWatch;

/// Errors an engine run can end with.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The flow disappeared from the store.
    #[error("flow {0} not found")]
    FlowNotFound(Uuid),
    /// A poller returned without a match before its budget ran out.
    #[error("stage {stage} incomplete: poller returned without match")]
    StageIncomplete {
        /// Stage group name.
        stage: &'static str,
        /// Chain the stage was observing.
        chain: ChainKey,
    },
    /// No RPC provider configured for a chain id.
    #[error("no provider configured for chain {0}")]
    MissingProvider(String),
    /// No registered chain maps to the needed progress key.
    #[error("no registered chain for key {0}")]
    MissingChain(ChainKey),
    /// Chain RPC failure that escaped the polling layer.
    #[error(transparent)]
    Chain(#[from] ChainRpcError),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// RPC providers, keyed by chain id.
#[derive(Clone, Default)]
pub struct ProviderSet {
    /// EVM providers.
    pub evm: HashMap<String, Arc<dyn EvmProvider>>,
    /// Tendermint providers.
    pub tendermint: HashMap<String, Arc<dyn TendermintProvider>>,
}

/// The per-flow orchestrator: sequences pollers stage by stage, applies
/// timeouts, persists progress and fans out status updates.
#[derive(new)]
pub struct TrackerEngine {
    store: Arc<dyn FlowStore>,
    events: Arc<dyn StatusEvents>,
    registry: Arc<ChainRegistry>,
    polling: PollingConfigs,
    providers: ProviderSet,
    metrics: Arc<CoreMetrics>,
    #[new(default)]
    supervisor: Option<crate::supervisor::FlowSupervisor>,
}

/// The ordered stage groups of each flow shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageGroup {
    EvmBurn,
    NobleDeposit,
    NamadaReceive,
    NamadaSend,
    NobleOrbiter,
    EvmMint,
}

impl StageGroup {
    fn name(&self) -> &'static str {
        match self {
            StageGroup::EvmBurn => "evm_burn",
            StageGroup::NobleDeposit => "noble_deposit",
            StageGroup::NamadaReceive => "namada_receive",
            StageGroup::NamadaSend => "namada_send",
            StageGroup::NobleOrbiter => "noble_orbiter",
            StageGroup::EvmMint => "evm_mint",
        }
    }

    fn chain_key(&self) -> ChainKey {
        match self {
            StageGroup::EvmBurn | StageGroup::EvmMint => ChainKey::Evm,
            StageGroup::NobleDeposit | StageGroup::NobleOrbiter => ChainKey::Noble,
            StageGroup::NamadaReceive | StageGroup::NamadaSend => ChainKey::Namada,
        }
    }

    fn sequence(flow_type: FlowType) -> &'static [StageGroup] {
        match flow_type {
            FlowType::Deposit => &[
                StageGroup::EvmBurn,
                StageGroup::NobleDeposit,
                StageGroup::NamadaReceive,
            ],
            FlowType::Payment => &[
                StageGroup::NamadaSend,
                StageGroup::NobleOrbiter,
                StageGroup::EvmMint,
            ],
        }
    }
}

/// How one stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageEnd {
    Confirmed,
    Skipped,
    TimedOut,
    Cancelled,
}

impl TrackerEngine {
    /// Report per-stage timeout tracking to the flow supervisor.
    pub fn with_supervisor(mut self, supervisor: crate::supervisor::FlowSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Drive one flow until a terminal status, cancellation, or stage
    /// exhaustion. Errors have already been folded into flow state when this
    /// returns `Err`; the caller only decides whether to retry the job.
    #[instrument(skip(self, cancel), fields(flow_id = %flow_id))]
    pub async fn run_flow(
        &self,
        flow_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let mut flow = self
            .store
            .flow(flow_id)
            .await?
            .ok_or(EngineError::FlowNotFound(flow_id))?;

        if flow.status.is_terminal() {
            debug!(status = flow.status.as_str(), "flow already terminal, nothing to do");
            return Ok(());
        }

        let params = FlowParams::derive(&flow);
        match self.run_stages(&mut flow, &params, &cancel).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.absorb_engine_error(flow_id, err).await
            }
        }
    }

    async fn run_stages(
        &self,
        flow: &mut Flow,
        params: &FlowParams,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let sequence = StageGroup::sequence(flow.flow_type);
        let final_group = *sequence.last().expect("flow shapes have stages");
        for group in sequence {
            match self.drive_stage(flow, *group, params, cancel).await? {
                StageEnd::Confirmed => {
                    if *group == final_group {
                        self.complete_flow(flow, group.chain_key()).await?;
                    }
                }
                StageEnd::Skipped => {
                    // Downstream stages may still have their own prerequisites.
                    continue;
                }
                StageEnd::TimedOut | StageEnd::Cancelled => return Ok(()),
            }
        }
        if flow.status == FlowStatus::Pending {
            debug!(flow_id = %flow.id, "stage sequence exhausted without terminal status");
        }
        Ok(())
    }

    async fn drive_stage(
        &self,
        flow: &mut Flow,
        group: StageGroup,
        params: &FlowParams,
        cancel: &CancellationToken,
    ) -> Result<StageEnd, EngineError> {
        let chain_key = group.chain_key();
        // A resumed run re-enters the sequence from the top; chains that
        // already confirmed are not polled again.
        if flow.chain_progress.get(chain_key).map(|e| e.status) == Some(ChainStatus::Confirmed) {
            debug!(stage = group.name(), "chain already confirmed, skipping stage");
            return Ok(StageEnd::Confirmed);
        }
        let Some(chain_id) = self.chain_id_for(flow, group) else {
            return Err(EngineError::MissingChain(chain_key));
        };
        let conf = self.polling.for_chain(&chain_id);
        let stage_timeout = Duration::from_millis(conf.max_duration_min * 60_000);
        let started = Instant::now();

        let (observer_tx, mut observer_rx) = mpsc::unbounded_channel::<StageObservation>();
        let poll_params = PollParams {
            flow_id: flow.id,
            chain_id: chain_id.clone(),
            start_block: 0,
            timeout: stage_timeout,
            poll_interval: Duration::from_millis(conf.poll_interval_ms),
            block_request_delay: Duration::from_millis(conf.block_request_delay_ms.unwrap_or(0)),
            // Stage timeout aborts only this leaf; engine stop cancels the
            // whole linked chain.
            cancel: cancel.child_token(),
        };

        info!(stage = group.name(), chain = %chain_id, timeout_ms = stage_timeout.as_millis() as u64, "starting stage");
        if let Some(supervisor) = &self.supervisor {
            supervisor.note_stage(flow.id, group.name(), stage_timeout);
        }
        let poll = self
            .poll_group(flow, group, params, poll_params, &chain_id, observer_tx)
            .await?;

        let Some(poll) = poll else {
            info!(stage = group.name(), "prerequisites missing, skipping stage");
            return Ok(StageEnd::Skipped);
        };

        tokio::pin!(poll);
        let result = loop {
            tokio::select! {
                res = &mut poll => break res,
                Some(observation) = observer_rx.recv() => {
                    self.record_observation(flow, chain_key, observation).await?;
                }
            }
        };
        // Pick up observations that raced the poller's return.
        while let Ok(observation) = observer_rx.try_recv() {
            self.record_observation(flow, chain_key, observation).await?;
        }

        let elapsed = started.elapsed();
        self.metrics
            .stage_poll_duration
            .with_label_values(&[chain_key.as_str()])
            .observe(elapsed.as_secs_f64());

        match result {
            Err(err) => Err(EngineError::Chain(err)),
            Ok(result) if result.matched => {
                self.confirm_group(flow, group, &result).await?;
                Ok(StageEnd::Confirmed)
            }
            Ok(_) => {
                if elapsed >= stage_timeout {
                    self.handle_polling_timeout(flow.id, group, stage_timeout, elapsed)
                        .await?;
                    Ok(StageEnd::TimedOut)
                } else if cancel.is_cancelled() {
                    debug!(stage = group.name(), "stage cancelled");
                    Ok(StageEnd::Cancelled)
                } else {
                    Err(EngineError::StageIncomplete {
                        stage: group.name(),
                        chain: chain_key,
                    })
                }
            }
        }
    }

    /// Build the poll future for a stage group, or `None` when its
    /// prerequisite parameters are absent.
    async fn poll_group<'a>(
        &'a self,
        flow: &mut Flow,
        group: StageGroup,
        params: &FlowParams,
        mut poll_params: PollParams,
        chain_id: &str,
        observer: mpsc::UnboundedSender<StageObservation>,
    ) -> Result<
        Option<std::pin::Pin<Box<dyn std::future::Future<Output = crossflow_core::ChainResult<PollResult>> + Send + 'a>>>,
        EngineError,
    > {
        match (group, params) {
            (StageGroup::EvmBurn, FlowParams::Deposit(p)) => {
                // The EVM leg of a deposit is auxiliary: it runs only when
                // the flow carries an evm progress entry (pre-seeded by the
                // client) alongside a burn hash.
                if flow.chain_progress.get(ChainKey::Evm).is_none() {
                    return Ok(None);
                }
                let Some(hash) = p.evm_burn_tx_hash.as_deref().and_then(parse_h256) else {
                    return Ok(None);
                };
                let provider = self.evm_provider(chain_id)?;
                Ok(Some(Box::pin(async move {
                    crossflow_ethereum::poll_burn_receipt(provider.as_ref(), &poll_params, hash)
                        .await
                })))
            }
            (StageGroup::NobleDeposit, FlowParams::Deposit(p)) => {
                let (Some(forwarding), Some(receiver), Some(amount)) = (
                    p.forwarding_address.clone(),
                    p.namada_receiver.clone(),
                    p.expected_amount_uusdc.clone(),
                ) else {
                    return Ok(None);
                };
                let provider = self.tendermint_provider(chain_id)?;
                poll_params.start_block = self
                    .resolve_start_block(flow, ChainKey::Noble, chain_id)
                    .await?;
                let watch = NobleDepositWatch {
                    forwarding_address: forwarding,
                    namada_receiver: receiver,
                    expected_amount_uusdc: amount,
                };
                Ok(Some(Box::pin(async move {
                    noble::poll_for_deposit(provider.as_ref(), &poll_params, &watch, Some(&observer))
                        .await
                })))
            }
            (StageGroup::NamadaReceive, FlowParams::Deposit(p)) => {
                let (Some(forwarding), Some(receiver), Some(amount)) = (
                    p.forwarding_address.clone(),
                    p.namada_receiver.clone(),
                    p.expected_amount_uusdc.clone(),
                ) else {
                    return Ok(None);
                };
                let provider = self.tendermint_provider(chain_id)?;
                poll_params.start_block = self
                    .resolve_start_block(flow, ChainKey::Namada, chain_id)
                    .await?;
                let watch = NamadaDepositWatch {
                    forwarding_address: forwarding,
                    namada_receiver: receiver,
                    expected_amount_uusdc: amount,
                };
                Ok(Some(Box::pin(async move {
                    namada::poll_for_deposit(provider.as_ref(), &poll_params, &watch).await
                })))
            }
            (StageGroup::NamadaSend, FlowParams::Payment(p)) => {
                let Some(hash) = p.namada_ibc_tx_hash.clone() else {
                    return Ok(None);
                };
                let provider = self.tendermint_provider(chain_id)?;
                Ok(Some(Box::pin(async move {
                    namada::confirm_ibc_send(provider.as_ref(), &poll_params, &hash).await
                })))
            }
            (StageGroup::NobleOrbiter, FlowParams::Payment(p)) => {
                let (
                    Some(memo),
                    Some(amount),
                    Some(receiver),
                    Some(caller),
                    Some(mint_recipient),
                    Some(domain),
                ) = (
                    p.memo_json.clone(),
                    p.amount_base_units.clone(),
                    p.forwarding_address.clone(),
                    p.destination_caller_b64.clone(),
                    p.mint_recipient_b64.clone(),
                    p.destination_domain,
                ) else {
                    return Ok(None);
                };
                let provider = self.tendermint_provider(chain_id)?;
                poll_params.start_block = self
                    .resolve_start_block(flow, ChainKey::Noble, chain_id)
                    .await?;
                let watch = OrbiterWatch {
                    memo_json: memo,
                    amount,
                    receiver,
                    destination_caller_b64: caller,
                    mint_recipient_b64: mint_recipient,
                    destination_domain: domain,
                };
                Ok(Some(Box::pin(async move {
                    noble::poll_for_orbiter(provider.as_ref(), &poll_params, &watch, Some(&observer))
                        .await
                })))
            }
            (StageGroup::EvmMint, FlowParams::Payment(p)) => {
                let (Some(usdc), Some(recipient), Some(amount)) = (
                    p.usdc_address.as_deref().and_then(parse_h160),
                    p.recipient.as_deref().and_then(parse_h160),
                    p.amount_base_units.as_deref().and_then(parse_u256_dec),
                ) else {
                    return Ok(None);
                };
                let provider = self.evm_provider(chain_id)?;
                poll_params.start_block = self
                    .resolve_evm_start_block(flow, chain_id)
                    .await?;
                let watch = MintWatch {
                    usdc,
                    recipient,
                    amount,
                };
                Ok(Some(Box::pin(async move {
                    crossflow_ethereum::poll_usdc_mint(provider.as_ref(), &poll_params, &watch)
                        .await
                })))
            }
            // A stage group never pairs with the other flow shape's params.
            _ => Ok(None),
        }
    }

    /// Persist and publish an intermediate observation.
    async fn record_observation(
        &self,
        flow: &mut Flow,
        chain: ChainKey,
        observation: StageObservation,
    ) -> Result<(), EngineError> {
        let mut stage = Stage::confirmed(observation.stage, observation.tx_hash.clone());
        if let Some(block) = observation.block {
            let mut meta = Map::new();
            meta.insert("block".into(), json!(block));
            stage.metadata = Some(meta);
        }
        self.append_and_publish(flow, chain, stage).await
    }

    /// Append a stage, write its audit row and fan it out. Stages are
    /// append-only and recorded at most once per symbol, so a resumed run
    /// that re-observes an event does not duplicate it.
    async fn append_and_publish(
        &self,
        flow: &mut Flow,
        chain: ChainKey,
        stage: Stage,
    ) -> Result<(), EngineError> {
        let flow_id = flow.id;
        let already_recorded = flow
            .chain_progress
            .get(chain)
            .is_some_and(|entry| entry.stages.iter().any(|s| s.stage == stage.stage));
        if already_recorded {
            debug!(stage = %stage.stage, "stage already recorded, skipping duplicate");
            return Ok(());
        }
        *flow = self.store.append_stage(flow_id, chain, stage.clone()).await?;
        self.store
            .append_status_log(NewStatusLog::for_stage(flow_id, chain, &stage))
            .await?;
        self.metrics
            .stages_confirmed
            .with_label_values(&[chain.as_str(), &stage.stage])
            .inc();
        self.events
            .publish(StatusUpdate::from_stage(flow_id, chain, &stage));
        Ok(())
    }

    /// Fold a matched poll result into flow state for its group.
    async fn confirm_group(
        &self,
        flow: &mut Flow,
        group: StageGroup,
        result: &PollResult,
    ) -> Result<(), EngineError> {
        let chain = group.chain_key();
        // Groups with a single observable event append it here; the
        // two-condition Noble groups already streamed theirs through the
        // observer channel.
        let final_stage = match group {
            StageGroup::EvmBurn => Some(stages::EVM_USDC_BURNED),
            StageGroup::NamadaReceive => Some(stages::NAMADA_RECEIVED),
            StageGroup::NamadaSend => Some(stages::NAMADA_IBC_SENT),
            StageGroup::EvmMint => Some(stages::EVM_USDC_MINTED),
            StageGroup::NobleDeposit | StageGroup::NobleOrbiter => None,
        };
        if let Some(symbol) = final_stage {
            let mut stage = Stage::confirmed(symbol, result.tx_hash.clone());
            if let Some(block) = result.block {
                let mut meta = Map::new();
                meta.insert("block".into(), json!(block));
                stage.metadata = Some(meta);
            }
            self.append_and_publish(flow, chain, stage).await?;
        }

        let updated = self
            .store
            .set_chain_status(flow.id, chain, ChainStatus::Confirmed, result.tx_hash.clone())
            .await?;
        *flow = updated;
        info!(stage = group.name(), chain = %chain, block = ?result.block, "stage confirmed");
        Ok(())
    }

    /// Mark the flow completed and announce it on the terminating chain.
    async fn complete_flow(&self, flow: &mut Flow, chain: ChainKey) -> Result<(), EngineError> {
        let flow_id = flow.id;
        match self
            .store
            .set_status_if_pending(flow_id, FlowStatus::Completed, None)
            .await?
        {
            StatusWrite::Applied(updated) => {
                flow.status = updated.status;
                self.metrics
                    .flows_terminal
                    .with_label_values(&["completed"])
                    .inc();
                self.events.publish(StatusUpdate {
                    flow_id,
                    chain,
                    stage: "completed".to_owned(),
                    status: ChainStatus::Confirmed,
                    message: None,
                    tx_hash: None,
                    occurred_at: chrono::Utc::now(),
                    source: StageSource::Poller,
                    metadata: None,
                });
                info!(flow_id = %flow_id, "flow completed");
            }
            StatusWrite::AlreadyTerminal(status) => {
                debug!(flow_id = %flow_id, status = status.as_str(), "completion raced a terminal status");
            }
        }
        Ok(())
    }

    /// Stage budget exhausted: record `undetermined` unless the flow already
    /// reached a terminal status.
    async fn handle_polling_timeout(
        &self,
        flow_id: Uuid,
        group: StageGroup,
        budget: Duration,
        elapsed: Duration,
    ) -> Result<(), EngineError> {
        let timeout_ms = budget.as_millis() as u64;
        let elapsed_ms = elapsed.as_millis() as u64;
        let error = ErrorState::timeout(group.name(), timeout_ms, elapsed_ms);
        match self
            .store
            .set_status_if_pending(flow_id, FlowStatus::Undetermined, Some(error))
            .await?
        {
            StatusWrite::AlreadyTerminal(status) => {
                debug!(flow_id = %flow_id, status = status.as_str(), "timeout raced a terminal status, leaving it");
                Ok(())
            }
            StatusWrite::Applied(_) => {
                warn!(flow_id = %flow_id, stage = group.name(), timeout_ms, elapsed_ms, "stage timed out, flow undetermined");
                let chain = group.chain_key();
                let stage_symbol = format!("{}_timeout", group.name());
                self.store
                    .append_status_log(NewStatusLog {
                        flow_id,
                        stage: stage_symbol.clone(),
                        chain,
                        source: StageSource::Poller,
                        detail: json!({
                            "status": "failed",
                            "reason": "timeout",
                            "timeoutMs": timeout_ms,
                            "elapsedMs": elapsed_ms,
                        }),
                    })
                    .await?;
                self.metrics
                    .flows_terminal
                    .with_label_values(&["undetermined"])
                    .inc();
                self.events.publish(StatusUpdate {
                    flow_id,
                    chain,
                    stage: stage_symbol,
                    status: ChainStatus::Failed,
                    message: Some("stage timed out".to_owned()),
                    tx_hash: None,
                    occurred_at: chrono::Utc::now(),
                    source: StageSource::Poller,
                    metadata: None,
                });
                Ok(())
            }
        }
    }

    /// Terminal-status guard for non-timeout failures: a straggler run must
    /// never overwrite a terminal verdict, everything else becomes `failed`.
    async fn absorb_engine_error(
        &self,
        flow_id: Uuid,
        err: EngineError,
    ) -> Result<(), EngineError> {
        let current = self
            .store
            .flow(flow_id)
            .await?
            .map(|f| f.status)
            .unwrap_or(FlowStatus::Pending);
        if current.is_terminal() {
            debug!(flow_id = %flow_id, status = current.as_str(), error = %err, "error after terminal status, ignoring");
            return Ok(());
        }

        let message = err.to_string();
        if message.contains("timeout") || message.contains("incomplete") {
            warn!(flow_id = %flow_id, error = %message, "tracking failed");
        } else {
            error!(flow_id = %flow_id, error = %message, "tracking failed");
        }

        let chain = match &err {
            EngineError::StageIncomplete { chain, .. } => *chain,
            EngineError::MissingChain(chain) => *chain,
            _ => ChainKey::Noble,
        };
        if let StatusWrite::Applied(_) = self
            .store
            .set_status_if_pending(flow_id, FlowStatus::Failed, Some(ErrorState::failure(&message)))
            .await?
        {
            self.metrics
                .flows_terminal
                .with_label_values(&["failed"])
                .inc();
            self.events.publish(StatusUpdate {
                flow_id,
                chain,
                stage: "tracking_failed".to_owned(),
                status: ChainStatus::Failed,
                message: Some(message),
                tx_hash: None,
                occurred_at: chrono::Utc::now(),
                source: StageSource::Poller,
                metadata: None,
            });
        }
        Err(err)
    }

    /// Resolve the scan start height for a Tendermint stage, persisting
    /// `max(0, tip - backscan)` exactly once and caching it on the local
    /// flow to avoid a re-fetch.
    async fn resolve_start_block(
        &self,
        flow: &mut Flow,
        chain: ChainKey,
        chain_id: &str,
    ) -> Result<u64, EngineError> {
        if let Some(existing) = flow.chain_progress.get(chain).and_then(|e| e.start_block) {
            return Ok(existing);
        }
        let provider = self.tendermint_provider(chain_id)?;
        let tip = provider.latest_block_height().await?;
        let computed = tip.saturating_sub(self.polling.for_chain(chain_id).block_window_backscan);
        let effective = self.store.ensure_start_block(flow.id, chain, computed).await?;
        flow.chain_progress.entry_mut(chain).start_block = Some(effective);
        Ok(effective)
    }

    /// Same as [`Self::resolve_start_block`] but against the EVM tip.
    async fn resolve_evm_start_block(
        &self,
        flow: &mut Flow,
        chain_id: &str,
    ) -> Result<u64, EngineError> {
        if let Some(existing) = flow
            .chain_progress
            .get(ChainKey::Evm)
            .and_then(|e| e.start_block)
        {
            return Ok(existing);
        }
        let provider = self.evm_provider(chain_id)?;
        let tip = provider.block_number().await?;
        let computed = tip.saturating_sub(self.polling.for_chain(chain_id).block_window_backscan);
        let effective = self
            .store
            .ensure_start_block(flow.id, ChainKey::Evm, computed)
            .await?;
        flow.chain_progress.entry_mut(ChainKey::Evm).start_block = Some(effective);
        Ok(effective)
    }

    fn chain_id_for(&self, flow: &Flow, group: StageGroup) -> Option<String> {
        match group {
            StageGroup::EvmBurn | StageGroup::NamadaSend => Some(flow.initial_chain.clone()),
            StageGroup::EvmMint | StageGroup::NamadaReceive => {
                Some(flow.destination_chain.clone())
            }
            StageGroup::NobleDeposit | StageGroup::NobleOrbiter => self
                .registry
                .iter()
                .find(|(id, conf)| conf.progress_key(id) == ChainKey::Noble)
                .map(|(id, _)| id.clone()),
        }
    }

    fn evm_provider(&self, chain_id: &str) -> Result<Arc<dyn EvmProvider>, EngineError> {
        self.providers
            .evm
            .get(chain_id)
            .cloned()
            .ok_or_else(|| EngineError::MissingProvider(chain_id.to_owned()))
    }

    fn tendermint_provider(
        &self,
        chain_id: &str,
    ) -> Result<Arc<dyn TendermintProvider>, EngineError> {
        self.providers
            .tendermint
            .get(chain_id)
            .cloned()
            .ok_or_else(|| EngineError::MissingProvider(chain_id.to_owned()))
    }
}

fn parse_h256(raw: &str) -> Option<H256> {
    H256::from_str(raw.trim_start_matches("0x")).ok()
}

fn parse_h160(raw: &str) -> Option<H160> {
    H160::from_str(raw.trim_start_matches("0x")).ok()
}

fn parse_u256_dec(raw: &str) -> Option<U256> {
    U256::from_dec_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crossflow_base::StatusEventBus;
    use crossflow_core::{
        AbciEvent, BlockResults, ChainConf, ChainContracts, ChainPollingConf, ChainType,
        EventAttribute, NewFlow, TxLookup, TxResult,
    };
    use crossflow_ethereum::{address_topic, transfer_topic};
    use crossflow_test::{MemoryFlowStore, MockEvmProvider, MockTendermintProvider};

    use super::*;

    const DEPOSIT_TX: &str =
        "0xd8294b1c510caa839db96ca7a9992c3e53ed082b1e9467a8311a0747435d3759";
    const FORWARDING: &str = "noble1cugfxuln9k2zsvey7yuaeckr7avfzffd7d44jp";
    const NAMADA_RECEIVER: &str = "tnam1qprxs9n5afscskramwajyrdjw5a64lwweudc0l78";
    const INNER_TX: &str = "DCAB74AC2C54A1B089B802AEBA0E7BFA84A4B4D8C397BFF23826BB5D29E09D80";
    const NOBLE_HEIGHT: u64 = 42_569_565;
    const NAMADA_HEIGHT: u64 = 3_418_841;

    struct Harness {
        store: Arc<MemoryFlowStore>,
        noble: Arc<MockTendermintProvider>,
        namada: Arc<MockTendermintProvider>,
        evm: Arc<MockEvmProvider>,
        engine: TrackerEngine,
    }

    fn chain_conf(chain_type: ChainType, network: &str) -> ChainConf {
        ChainConf {
            chain_type,
            network: network.to_owned(),
            display_name: network.to_owned(),
            rpc_urls: vec!["http://localhost:26657".to_owned()],
            explorer: None,
            contracts: Some(ChainContracts::default()),
            gasless: None,
        }
    }

    fn harness() -> Harness {
        let mut registry = ChainRegistry::default();
        registry
            .0
            .insert("sepolia".into(), chain_conf(ChainType::Evm, "sepolia"));
        registry.0.insert(
            "noble-testnet".into(),
            chain_conf(ChainType::Tendermint, "grand-1"),
        );
        registry.0.insert(
            "namada-testnet".into(),
            chain_conf(ChainType::Tendermint, "namada-internal"),
        );

        let mut polling = PollingConfigs::default();
        for chain in ["sepolia", "noble-testnet", "namada-testnet"] {
            polling.0.insert(
                chain.to_owned(),
                ChainPollingConf {
                    max_duration_min: 1,
                    block_window_backscan: 20,
                    poll_interval_ms: 25,
                    block_request_delay_ms: None,
                },
            );
        }

        let store = Arc::new(MemoryFlowStore::new());
        let noble = Arc::new(MockTendermintProvider::new(NOBLE_HEIGHT));
        let namada = Arc::new(MockTendermintProvider::new(NAMADA_HEIGHT));
        let evm = Arc::new(MockEvmProvider::new(105));

        let mut providers = ProviderSet::default();
        providers
            .tendermint
            .insert("noble-testnet".into(), noble.clone() as _);
        providers
            .tendermint
            .insert("namada-testnet".into(), namada.clone() as _);
        providers.evm.insert("sepolia".into(), evm.clone() as _);

        let engine = TrackerEngine::new(
            store.clone() as Arc<dyn FlowStore>,
            Arc::new(StatusEventBus::new()) as Arc<dyn StatusEvents>,
            Arc::new(registry),
            polling,
            providers,
            Arc::new(crossflow_base::CoreMetrics::new().unwrap()),
        );

        Harness {
            store,
            noble,
            namada,
            evm,
            engine,
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

    fn noble_deposit_block(height: u64, amount: &str) -> BlockResults {
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

    fn namada_ack_block(height: u64) -> BlockResults {
        let packet = format!(
            r#"{{"sender":"{FORWARDING}","receiver":"{NAMADA_RECEIVER}","denom":"uusdc","amount":"100000"}}"#
        );
        BlockResults {
            height,
            txs_results: vec![],
            finalize_block_events: vec![],
            end_block_events: vec![
                event("message", &[("inner-tx-hash", INNER_TX)]),
                event(
                    "write_acknowledgement",
                    &[
                        ("packet_ack", r#"{"result":"AQ=="}"#),
                        ("packet_data", &packet),
                    ],
                ),
            ],
        }
    }

    async fn create_deposit_flow(store: &MemoryFlowStore) -> Flow {
        let metadata = json!({
            "forwardingAddress": FORWARDING,
            "namadaReceiver": NAMADA_RECEIVER,
            "expectedAmountUusdc": "100000uusdc",
        });
        let serde_json::Value::Object(metadata) = metadata else {
            unreachable!()
        };
        store
            .create_flow(NewFlow {
                flow_type: FlowType::Deposit,
                initial_chain: "sepolia".into(),
                destination_chain: "namada-testnet".into(),
                tx_hash: Some(DEPOSIT_TX.into()),
                metadata,
                chain_progress: None,
            })
            .await
            .unwrap()
            .into_flow()
    }

    #[tokio::test(start_paused = true)]
    async fn deposit_happy_path_completes_with_ordered_logs() {
        let h = harness();
        h.noble
            .add_block(NOBLE_HEIGHT, noble_deposit_block(NOBLE_HEIGHT, "100000uusdc"));
        h.namada.add_block(NAMADA_HEIGHT, namada_ack_block(NAMADA_HEIGHT));

        let flow = create_deposit_flow(&h.store).await;
        h.engine
            .run_flow(flow.id, CancellationToken::new())
            .await
            .unwrap();

        let flow = h.store.flow(flow.id).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Completed);

        let noble_entry = flow.chain_progress.get(ChainKey::Noble).unwrap();
        assert_eq!(noble_entry.status, ChainStatus::Confirmed);
        let namada_entry = flow.chain_progress.get(ChainKey::Namada).unwrap();
        assert_eq!(namada_entry.status, ChainStatus::Confirmed);
        assert_eq!(namada_entry.tx_hash.as_deref(), Some(INNER_TX));

        let logs = h.store.status_logs(flow.id).await.unwrap();
        let stages: Vec<&str> = logs.iter().map(|row| row.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec!["noble_cctp_minted", "noble_ibc_forwarded", "namada_received"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stage_timeout_yields_undetermined() {
        let h = harness();
        // Only empty blocks on both chains.
        let flow = create_deposit_flow(&h.store).await;

        h.engine
            .run_flow(flow.id, CancellationToken::new())
            .await
            .unwrap();

        let flow = h.store.flow(flow.id).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Undetermined);
        let error = flow.error_state.unwrap();
        assert_eq!(error.reason.as_deref(), Some("timeout"));
        assert_eq!(error.stage.as_deref(), Some("noble_deposit"));
        assert_eq!(error.timeout_ms, Some(60_000));
        assert!(error.elapsed_ms.unwrap() >= 60_000);

        let logs = h.store.status_logs(flow.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].stage, "noble_deposit_timeout");
        assert_eq!(logs[0].detail["status"], "failed");
        assert_eq!(logs[0].detail["reason"], "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn non_matching_amount_times_out_without_mint_stage() {
        let h = harness();
        h.noble
            .add_block(NOBLE_HEIGHT, noble_deposit_block(NOBLE_HEIGHT, "99999uusdc"));

        let flow = create_deposit_flow(&h.store).await;
        h.engine
            .run_flow(flow.id, CancellationToken::new())
            .await
            .unwrap();

        let flow = h.store.flow(flow.id).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Undetermined);

        let logs = h.store.status_logs(flow.id).await.unwrap();
        assert!(logs.iter().all(|row| row.stage != "noble_cctp_minted"));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_status_is_never_overwritten() {
        let h = harness();
        h.noble
            .add_block(NOBLE_HEIGHT, noble_deposit_block(NOBLE_HEIGHT, "100000uusdc"));
        h.namada.add_block(NAMADA_HEIGHT, namada_ack_block(NAMADA_HEIGHT));

        let flow = create_deposit_flow(&h.store).await;
        h.engine
            .run_flow(flow.id, CancellationToken::new())
            .await
            .unwrap();

        // A straggler run over the completed flow is a no-op.
        h.engine
            .run_flow(flow.id, CancellationToken::new())
            .await
            .unwrap();
        let reread = h.store.flow(flow.id).await.unwrap().unwrap();
        assert_eq!(reread.status, FlowStatus::Completed);

        // And a late timeout verdict cannot displace the terminal status.
        let write = h
            .store
            .set_status_if_pending(
                flow.id,
                FlowStatus::Undetermined,
                Some(ErrorState::timeout("noble_deposit", 60_000, 61_000)),
            )
            .await
            .unwrap();
        assert_eq!(write, StatusWrite::AlreadyTerminal(FlowStatus::Completed));

        let logs = h.store.status_logs(flow.id).await.unwrap();
        assert_eq!(logs.len(), 3, "straggler must not add log rows");
    }

    #[tokio::test(start_paused = true)]
    async fn start_block_is_written_once_and_kept() {
        let h = harness();
        h.noble
            .add_block(NOBLE_HEIGHT, noble_deposit_block(NOBLE_HEIGHT, "100000uusdc"));
        h.namada.add_block(NAMADA_HEIGHT, namada_ack_block(NAMADA_HEIGHT));

        let flow = create_deposit_flow(&h.store).await;
        h.engine
            .run_flow(flow.id, CancellationToken::new())
            .await
            .unwrap();

        let reread = h.store.flow(flow.id).await.unwrap().unwrap();
        let persisted = reread
            .chain_progress
            .get(ChainKey::Noble)
            .unwrap()
            .start_block
            .unwrap();
        assert_eq!(persisted, NOBLE_HEIGHT - 20);

        // A competing write with a different computed value keeps the first.
        let effective = h
            .store
            .ensure_start_block(flow.id, ChainKey::Noble, persisted + 500)
            .await
            .unwrap();
        assert_eq!(effective, persisted);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_leaves_flow_pending() {
        let h = harness();
        let flow = create_deposit_flow(&h.store).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        h.engine.run_flow(flow.id, cancel).await.unwrap();

        let reread = h.store.flow(flow.id).await.unwrap().unwrap();
        assert_eq!(reread.status, FlowStatus::Pending);
        assert!(h.store.status_logs(flow.id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn payment_happy_path_reaches_evm_mint() {
        let h = harness();

        h.namada.add_transaction(TxLookup {
            hash: INNER_TX.into(),
            height: NAMADA_HEIGHT,
            tx_result: TxResult {
                code: 0,
                events: vec![],
            },
        });

        let memo = r#"{"dest":"sepolia"}"#;
        let packet = format!(
            r#"{{"sender":"tnam1sender","receiver":"{FORWARDING}","denom":"transfer/channel-99/uusdc","amount":"250000","memo":"{}"}}"#,
            r#"{\"dest\":\"sepolia\"}"#,
        );
        h.noble.add_block(
            NOBLE_HEIGHT,
            BlockResults {
                height: NOBLE_HEIGHT,
                txs_results: vec![
                    TxResult {
                        code: 0,
                        events: vec![event(
                            "write_acknowledgement",
                            &[
                                ("packet_ack", r#"{"result":"AQ=="}"#),
                                ("packet_data", &packet),
                            ],
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
            },
        );

        let usdc = H160::repeat_byte(0x11);
        let recipient = H160::repeat_byte(0x22);
        h.evm.add_transfer_log(
            usdc,
            transfer_topic(),
            address_topic(H160::zero()),
            address_topic(recipient),
            U256::from(250_000u64),
            103,
            H256::repeat_byte(0xab),
        );

        let metadata = json!({
            "namadaIbcTxHash": INNER_TX,
            "memoJson": memo,
            "forwardingAddress": FORWARDING,
            "amountBaseUnits": "250000",
            "destinationCallerB64": "AAAA",
            "mintRecipientB64": "BBBB",
            "destinationDomain": 0,
            "usdcAddress": format!("{usdc:?}"),
            "recipient": format!("{recipient:?}"),
        });
        let serde_json::Value::Object(metadata) = metadata else {
            unreachable!()
        };
        let flow = h
            .store
            .create_flow(NewFlow {
                flow_type: FlowType::Payment,
                initial_chain: "namada-testnet".into(),
                destination_chain: "sepolia".into(),
                tx_hash: None,
                metadata,
                chain_progress: None,
            })
            .await
            .unwrap()
            .into_flow();

        h.engine
            .run_flow(flow.id, CancellationToken::new())
            .await
            .unwrap();

        let flow = h.store.flow(flow.id).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Completed);
        let evm_entry = flow.chain_progress.get(ChainKey::Evm).unwrap();
        assert_eq!(evm_entry.status, ChainStatus::Confirmed);
        assert!(evm_entry.tx_hash.as_deref().unwrap().starts_with("0xabab"));

        let logs = h.store.status_logs(flow.id).await.unwrap();
        let stages: Vec<&str> = logs.iter().map(|row| row.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec![
                "namada_ibc_sent",
                "noble_ibc_received",
                "noble_cctp_burned",
                "evm_usdc_minted"
            ]
        );
    }
}

