use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// A flow was started while an engine run for it is still active in this
/// process; callers treat this as a no-op duplicate.
#[derive(Debug, thiserror::Error)]
#[error("flow {0} is already being tracked")]
pub struct AlreadyActive(pub Uuid);

/// Commands understood by the supervisor task.
enum Command {
    Begin {
        flow_id: Uuid,
        reply: oneshot::Sender<Result<CancellationToken, AlreadyActive>>,
    },
    Finish {
        flow_id: Uuid,
    },
    Stop {
        flow_id: Uuid,
    },
    NoteStage {
        flow_id: Uuid,
        stage: &'static str,
        budget: Duration,
    },
    ActiveCount {
        reply: oneshot::Sender<usize>,
    },
}

struct ActiveFlow {
    cancel: CancellationToken,
    started: Instant,
    stage: Option<(&'static str, Duration, Instant)>,
}

/// Handle to the single task owning the active-flow registry.
///
/// All bookkeeping of cancellation controllers and per-stage timeout
/// tracking is serialized through this task; workers never share the maps
/// directly.
#[derive(Clone)]
pub struct FlowSupervisor {
    tx: mpsc::UnboundedSender<Command>,
}

impl FlowSupervisor {
    /// Spawn the supervisor task.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(
            async move {
                let mut active: HashMap<Uuid, ActiveFlow> = HashMap::new();
                while let Some(command) = rx.recv().await {
                    match command {
                        Command::Begin { flow_id, reply } => {
                            let result = if active.contains_key(&flow_id) {
                                Err(AlreadyActive(flow_id))
                            } else {
                                let cancel = CancellationToken::new();
                                active.insert(
                                    flow_id,
                                    ActiveFlow {
                                        cancel: cancel.clone(),
                                        started: Instant::now(),
                                        stage: None,
                                    },
                                );
                                Ok(cancel)
                            };
                            let _ = reply.send(result);
                        }
                        Command::Finish { flow_id } => {
                            if active.remove(&flow_id).is_none() {
                                debug!(flow_id = %flow_id, "finish for unknown flow");
                            }
                        }
                        Command::Stop { flow_id } => match active.get(&flow_id) {
                            Some(entry) => {
                                debug!(flow_id = %flow_id, "stopping flow");
                                entry.cancel.cancel();
                            }
                            // Stopping an unknown flow is a no-op.
                            None => debug!(flow_id = %flow_id, "stop for inactive flow"),
                        },
                        Command::NoteStage {
                            flow_id,
                            stage,
                            budget,
                        } => {
                            if let Some(entry) = active.get_mut(&flow_id) {
                                entry.stage = Some((stage, budget, Instant::now()));
                            }
                        }
                        Command::ActiveCount { reply } => {
                            let _ = reply.send(active.len());
                        }
                    }
                }
                // Channel closed: cancel whatever is still running.
                for (flow_id, entry) in active {
                    let stage = entry.stage.map(|(name, _, _)| name);
                    warn!(flow_id = %flow_id, elapsed = ?entry.started.elapsed(), ?stage, "supervisor shutting down with active flow");
                    entry.cancel.cancel();
                }
            }
            .instrument(info_span!("flow_supervisor")),
        );
        (Self { tx }, handle)
    }

    /// Register a flow as active, receiving its cancellation token.
    pub async fn begin(&self, flow_id: Uuid) -> Result<CancellationToken, AlreadyActive> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Begin { flow_id, reply })
            .map_err(|_| AlreadyActive(flow_id))?;
        rx.await.unwrap_or(Err(AlreadyActive(flow_id)))
    }

    /// Remove a finished flow from the registry.
    pub fn finish(&self, flow_id: Uuid) {
        let _ = self.tx.send(Command::Finish { flow_id });
    }

    /// Cancel an in-flight engine run. Unknown flows are a no-op.
    pub fn stop(&self, flow_id: Uuid) {
        let _ = self.tx.send(Command::Stop { flow_id });
    }

    /// Record the stage a flow is currently polling, with its budget.
    pub fn note_stage(&self, flow_id: Uuid, stage: &'static str, budget: Duration) {
        let _ = self.tx.send(Command::NoteStage {
            flow_id,
            stage,
            budget,
        });
    }

    /// Number of currently active flows.
    pub async fn active_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::ActiveCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_twice_reports_already_active() {
        let (supervisor, _task) = FlowSupervisor::spawn();
        let flow_id = Uuid::new_v4();

        let token = supervisor.begin(flow_id).await.unwrap();
        assert!(!token.is_cancelled());
        assert!(supervisor.begin(flow_id).await.is_err());
        assert_eq!(supervisor.active_count().await, 1);
    }

    #[tokio::test]
    async fn stop_cancels_the_flow_token() {
        let (supervisor, _task) = FlowSupervisor::spawn();
        let flow_id = Uuid::new_v4();

        let token = supervisor.begin(flow_id).await.unwrap();
        supervisor.stop(flow_id);
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn finish_frees_the_slot() {
        let (supervisor, _task) = FlowSupervisor::spawn();
        let flow_id = Uuid::new_v4();

        let _ = supervisor.begin(flow_id).await.unwrap();
        supervisor.finish(flow_id);
        // The slot becomes reusable once the supervisor processed the finish.
        let token = supervisor.begin(flow_id).await.unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn stop_unknown_flow_is_noop() {
        let (supervisor, _task) = FlowSupervisor::spawn();
        supervisor.stop(Uuid::new_v4());
        assert_eq!(supervisor.active_count().await, 0);
    }
}
