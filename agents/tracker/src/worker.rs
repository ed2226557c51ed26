use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, info_span, instrument::Instrumented, warn, Instrument};

use crossflow_base::CoreMetrics;
use crossflow_core::{FlowParams, FlowStore};

use crate::engine::TrackerEngine;
use crate::queue::{JobQueue, PollJob};
use crate::supervisor::FlowSupervisor;

/// Concurrent engine runs per process.
const CONCURRENCY: usize = 5;
/// Token-bucket rate for job starts.
const JOBS_PER_SECOND: f64 = 10.0;
/// Retry attempts per job.
const MAX_ATTEMPTS: u32 = 3;
/// First retry backoff; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_secs(2);
/// Delay before resume jobs become runnable.
const RESUME_DELAY: Duration = Duration::from_secs(1);

/// Token bucket limiting how fast workers pick up jobs.
#[derive(Debug)]
struct RateLimiter {
    state: Mutex<RateState>,
    rate: f64,
    burst: f64,
}

#[derive(Debug)]
struct RateState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    fn new(rate: f64) -> Self {
        Self {
            state: Mutex::new(RateState {
                tokens: rate,
                refilled_at: Instant::now(),
            }),
            rate,
            burst: rate,
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.refilled_at = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
                }
            };
            match wait {
                None => return,
                Some(delay) => sleep(delay).await,
            }
        }
    }
}

/// Pool of workers draining the job queue into engine runs.
pub struct FlowWorker {
    queue: JobQueue,
    engine: Arc<TrackerEngine>,
    supervisor: FlowSupervisor,
    store: Arc<dyn FlowStore>,
    metrics: Arc<CoreMetrics>,
    limiter: Arc<RateLimiter>,
}

impl FlowWorker {
    /// Assemble a worker pool over its collaborators.
    pub fn new(
        queue: JobQueue,
        engine: Arc<TrackerEngine>,
        supervisor: FlowSupervisor,
        store: Arc<dyn FlowStore>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            queue,
            engine,
            supervisor,
            store,
            metrics,
            limiter: Arc::new(RateLimiter::new(JOBS_PER_SECOND)),
        }
    }

    /// Spawn the worker tasks.
    pub fn spawn(self: Arc<Self>) -> Vec<Instrumented<JoinHandle<Result<()>>>> {
        (0..CONCURRENCY)
            .map(|slot| {
                let worker = self.clone();
                tokio::spawn(async move {
                    loop {
                        let job = worker.queue.next().await;
                        worker.limiter.acquire().await;
                        worker.metrics.queue_depth.set(worker.queue.depth() as i64);
                        worker.process(job).await;
                        worker.metrics.queue_depth.set(worker.queue.depth() as i64);
                    }
                })
                .instrument(info_span!("flow_worker", slot))
            })
            .collect()
    }

    /// Run one job to completion, retry, or final failure.
    async fn process(&self, job: PollJob) {
        let flow_id = job.flow_id;

        let flow = match self.store.flow(flow_id).await {
            Ok(Some(flow)) => flow,
            Ok(None) => {
                warn!(flow_id = %flow_id, job_id = %job.id, "job references missing flow");
                self.queue.fail(&job.id, "flow not found");
                return;
            }
            Err(err) => {
                self.retry_or_fail(job, &err.to_string());
                return;
            }
        };

        // A terminal flow makes any queued job a no-op; this is what makes
        // duplicate and resumed jobs harmless.
        if flow.status.is_terminal() {
            debug!(flow_id = %flow_id, status = flow.status.as_str(), "flow already terminal, job is a no-op");
            self.queue.complete(&job.id);
            return;
        }

        let cancel = match self.supervisor.begin(flow_id).await {
            Ok(cancel) => cancel,
            Err(_) => {
                // Another run inside this process holds the flow lock.
                debug!(flow_id = %flow_id, job_id = %job.id, "flow already active, dropping duplicate job");
                self.queue.complete(&job.id);
                return;
            }
        };

        let result = self.engine.run_flow(flow_id, cancel).await;
        self.supervisor.finish(flow_id);

        match result {
            Ok(()) => self.queue.complete(&job.id),
            Err(err) => self.retry_or_fail(job, &err.to_string()),
        }
    }

    fn retry_or_fail(&self, job: PollJob, error: &str) {
        let attempts = job.attempts + 1;
        if attempts >= MAX_ATTEMPTS {
            warn!(flow_id = %job.flow_id, job_id = %job.id, attempts, error, "job exhausted retries");
            self.queue.fail(&job.id, error);
            return;
        }
        let backoff = RETRY_BASE * 2u32.saturating_pow(attempts.saturating_sub(1));
        debug!(flow_id = %job.flow_id, job_id = %job.id, attempts, backoff_ms = backoff.as_millis() as u64, "requeueing job");
        self.queue.note_retry_error(&job.id, error);
        self.queue.enqueue(PollJob {
            attempts,
            not_before: Instant::now() + backoff,
            ..job
        });
    }

    /// Enqueue one resume job per non-terminal flow.
    ///
    /// Called once on startup; any jobs lost with the previous process are
    /// regenerated here, which is what makes the in-process queue durable.
    pub async fn resume_unfinished(&self) -> Result<usize> {
        let flows = self.store.list_unfinished().await?;
        let count = flows.len();
        for flow in flows {
            let job = PollJob {
                id: format!("resume-{}-{}", flow.id, Utc::now().timestamp_millis()),
                flow_id: flow.id,
                flow_type: flow.flow_type,
                params: FlowParams::derive(&flow),
                attempts: 0,
                not_before: Instant::now() + RESUME_DELAY,
            };
            self.queue.enqueue(job);
        }
        if count > 0 {
            info!(count, "resumed unfinished flows");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Map;
    use uuid::Uuid;

    use crossflow_base::{CoreMetrics, StatusEventBus};
    use crossflow_core::{
        ChainRegistry, FlowStatus, FlowType, NewFlow, PollingConfigs, StatusEvents,
    };
    use crossflow_test::MemoryFlowStore;

    use crate::engine::ProviderSet;
    use crate::supervisor::FlowSupervisor;

    use super::*;

    fn worker_over(store: Arc<MemoryFlowStore>) -> (Arc<FlowWorker>, JobQueue) {
        let metrics = Arc::new(CoreMetrics::new().unwrap());
        let engine = Arc::new(TrackerEngine::new(
            store.clone() as Arc<dyn FlowStore>,
            Arc::new(StatusEventBus::new()) as Arc<dyn StatusEvents>,
            Arc::new(ChainRegistry::default()),
            PollingConfigs::default(),
            ProviderSet::default(),
            metrics.clone(),
        ));
        let (supervisor, _task) = FlowSupervisor::spawn();
        let queue = JobQueue::new();
        let worker = Arc::new(FlowWorker::new(
            queue.clone(),
            engine,
            supervisor,
            store as Arc<dyn FlowStore>,
            metrics,
        ));
        (worker, queue)
    }

    async fn seed_flow(store: &MemoryFlowStore, terminal: bool) -> Uuid {
        let flow = store
            .create_flow(NewFlow {
                flow_type: FlowType::Deposit,
                initial_chain: "sepolia".into(),
                destination_chain: "namada-testnet".into(),
                tx_hash: None,
                metadata: Map::new(),
                chain_progress: None,
            })
            .await
            .unwrap()
            .into_flow();
        if terminal {
            store
                .set_status_if_pending(flow.id, FlowStatus::Completed, None)
                .await
                .unwrap();
        }
        flow.id
    }

    #[tokio::test]
    async fn resume_enqueues_one_job_per_unfinished_flow() {
        let store = Arc::new(MemoryFlowStore::new());
        let pending_id = seed_flow(&store, false).await;
        let _terminal_id = seed_flow(&store, true).await;

        let (worker, queue) = worker_over(store);
        let resumed = worker.resume_unfinished().await.unwrap();
        assert_eq!(resumed, 1);

        let jobs = queue.jobs_for_flow(pending_id);
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].id.starts_with(&format!("resume-{pending_id}-")));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_flow_job_is_a_no_op() {
        let store = Arc::new(MemoryFlowStore::new());
        let terminal_id = seed_flow(&store, true).await;

        let (worker, queue) = worker_over(store.clone());
        queue.enqueue(PollJob {
            id: format!("resume-{terminal_id}-1"),
            flow_id: terminal_id,
            flow_type: FlowType::Deposit,
            params: FlowParams::Deposit(Default::default()),
            attempts: 0,
            not_before: Instant::now(),
        });

        let job = queue.next().await;
        worker.process(job).await;

        let records = queue.jobs_for_flow(terminal_id);
        assert_eq!(records[0].state, crate::queue::JobState::Completed);
        // The flow itself is untouched.
        let flow = store.flow(terminal_id).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_paces_after_burst() {
        let limiter = RateLimiter::new(10.0);
        // The bucket starts full: a burst of 10 is immediate.
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The 11th token has to wait ~100ms for a refill.
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(95));
    }
}
