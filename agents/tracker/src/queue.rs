use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crossflow_core::{FlowParams, FlowType};

const COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const COMPLETED_CAP: usize = 1_000;
const FAILED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One unit of tracking work: run the engine for a flow.
#[derive(Debug, Clone)]
pub struct PollJob {
    /// Queue-unique job id.
    pub id: String,
    /// Flow to track.
    pub flow_id: Uuid,
    /// Flow shape, for logging.
    pub flow_type: FlowType,
    /// Typed tracking parameters captured at enqueue time.
    pub params: FlowParams,
    /// Attempts already made.
    pub attempts: u32,
    /// Earliest time the job may run.
    pub not_before: Instant,
}

impl PartialEq for PollJob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.not_before == other.not_before
    }
}

impl Eq for PollJob {}

impl PartialOrd for PollJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PollJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.not_before
            .cmp(&other.not_before)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Lifecycle state of a job, surfaced on `/flow/:id/job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for a worker slot (or its backoff).
    Queued,
    /// A worker is running the engine.
    Active,
    /// Finished; the engine run returned (or was a terminal no-op).
    Completed,
    /// Exhausted its retry budget.
    Failed,
}

/// Observable record of one job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Job id.
    pub id: String,
    /// Flow the job belongs to.
    pub flow_id: Uuid,
    /// Current state.
    pub state: JobState,
    /// Attempts made so far.
    pub attempts: u32,
    /// First enqueue time.
    pub enqueued_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Last error, for failed or retrying jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<PollJob>>,
    records: HashMap<String, JobRecord>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

impl QueueInner {
    fn prune(&mut self) {
        let now = Utc::now();
        while self.completed.len() > COMPLETED_CAP {
            if let Some(id) = self.completed.pop_front() {
                self.records.remove(&id);
            }
        }
        let completed_cutoff =
            now - chrono::Duration::from_std(COMPLETED_RETENTION).unwrap_or_default();
        while let Some(id) = self.completed.front() {
            match self.records.get(id) {
                Some(record) if record.updated_at < completed_cutoff => {
                    let id = self.completed.pop_front().unwrap();
                    self.records.remove(&id);
                }
                _ => break,
            }
        }
        let failed_cutoff = now - chrono::Duration::from_std(FAILED_RETENTION).unwrap_or_default();
        while let Some(id) = self.failed.front() {
            match self.records.get(id) {
                Some(record) if record.updated_at < failed_cutoff => {
                    let id = self.failed.pop_front().unwrap();
                    self.records.remove(&id);
                }
                _ => break,
            }
        }
    }
}

/// In-process job queue ordered by earliest runnable time.
///
/// Jobs carry their own backoff (`not_before`); retention of completed and
/// failed records follows the worker policy (24 h / 1000 completed, 7 days
/// failed). Durability across restarts comes from resume-on-startup, which
/// regenerates jobs for every non-terminal flow.
#[derive(Clone, Default)]
pub struct JobQueue {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<Notify>,
}

impl JobQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job, making it visible to workers at its `not_before`.
    pub fn enqueue(&self, job: PollJob) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        inner
            .records
            .entry(job.id.clone())
            .and_modify(|record| {
                record.state = JobState::Queued;
                record.attempts = job.attempts;
                record.updated_at = now;
            })
            .or_insert_with(|| JobRecord {
                id: job.id.clone(),
                flow_id: job.flow_id,
                state: JobState::Queued,
                attempts: job.attempts,
                enqueued_at: now,
                updated_at: now,
                last_error: None,
            });
        inner.heap.push(Reverse(job));
        inner.prune();
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for the next runnable job and mark it active.
    pub async fn next(&self) -> PollJob {
        loop {
            let wait = {
                let mut inner = self.inner.lock().unwrap();
                let now = Instant::now();
                let next_runnable = inner.heap.peek().map(|Reverse(job)| job.not_before);
                match next_runnable {
                    Some(runnable_at) if runnable_at <= now => {
                        let Reverse(job) = inner.heap.pop().unwrap();
                        if let Some(record) = inner.records.get_mut(&job.id) {
                            record.state = JobState::Active;
                            record.attempts = job.attempts + 1;
                            record.updated_at = Utc::now();
                        }
                        return job;
                    }
                    Some(runnable_at) => Some(runnable_at - now),
                    None => None,
                }
            };
            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Record a finished job.
    pub fn complete(&self, job_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(job_id) {
            record.state = JobState::Completed;
            record.updated_at = Utc::now();
        }
        inner.completed.push_back(job_id.to_owned());
        inner.prune();
    }

    /// Record a job that exhausted its retry budget.
    pub fn fail(&self, job_id: &str, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(job_id) {
            record.state = JobState::Failed;
            record.last_error = Some(error.to_owned());
            record.updated_at = Utc::now();
        }
        inner.failed.push_back(job_id.to_owned());
        inner.prune();
    }

    /// Note the error on a job that will be retried.
    pub fn note_retry_error(&self, job_id: &str, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(job_id) {
            record.last_error = Some(error.to_owned());
            record.updated_at = Utc::now();
        }
    }

    /// All known job records for a flow, newest first.
    pub fn jobs_for_flow(&self, flow_id: Uuid) -> Vec<JobRecord> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<JobRecord> = inner
            .records
            .values()
            .filter(|record| record.flow_id == flow_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
        records
    }

    /// Jobs currently queued or active.
    pub fn depth(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .values()
            .filter(|r| matches!(r.state, JobState::Queued | JobState::Active))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use crossflow_core::DepositParams;

    use super::*;

    fn job(id: &str, delay: Duration) -> PollJob {
        PollJob {
            id: id.to_owned(),
            flow_id: Uuid::new_v4(),
            flow_type: FlowType::Deposit,
            params: FlowParams::Deposit(DepositParams::default()),
            attempts: 0,
            not_before: Instant::now() + delay,
        }
    }

    #[tokio::test]
    async fn jobs_pop_in_runnable_order() {
        let queue = JobQueue::new();
        queue.enqueue(job("b", Duration::from_millis(20)));
        queue.enqueue(job("a", Duration::ZERO));

        let first = queue.next().await;
        assert_eq!(first.id, "a");
        let second = queue.next().await;
        assert_eq!(second.id, "b");
    }

    #[tokio::test]
    async fn next_waits_for_backoff() {
        let queue = JobQueue::new();
        queue.enqueue(job("delayed", Duration::from_millis(30)));

        let started = Instant::now();
        let popped = queue.next().await;
        assert_eq!(popped.id, "delayed");
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn records_track_lifecycle() {
        let queue = JobQueue::new();
        let j = job("lifecycle", Duration::ZERO);
        let flow_id = j.flow_id;
        queue.enqueue(j);

        assert_eq!(queue.jobs_for_flow(flow_id)[0].state, JobState::Queued);
        let popped = queue.next().await;
        assert_eq!(queue.jobs_for_flow(flow_id)[0].state, JobState::Active);
        queue.complete(&popped.id);
        assert_eq!(queue.jobs_for_flow(flow_id)[0].state, JobState::Completed);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn failed_jobs_keep_their_error() {
        let queue = JobQueue::new();
        let j = job("failing", Duration::ZERO);
        let flow_id = j.flow_id;
        queue.enqueue(j);
        let popped = queue.next().await;
        queue.fail(&popped.id, "stage noble_deposit incomplete");

        let records = queue.jobs_for_flow(flow_id);
        assert_eq!(records[0].state, JobState::Failed);
        assert_eq!(
            records[0].last_error.as_deref(),
            Some("stage noble_deposit incomplete")
        );
    }
}
