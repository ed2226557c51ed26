use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crossflow_core::{StatusEvents, StatusUpdate};

const TOPIC_CAPACITY: usize = 64;

/// Topic-per-flow publish/subscribe fan-out for status updates.
///
/// Delivery is best-effort and at-most-once per subscriber: a slow receiver
/// that overruns the ring buffer misses events and is expected to reconcile
/// by re-reading flow status. Topics with no live subscribers are pruned on
/// publish.
#[derive(Debug, Default)]
pub struct StatusEventBus {
    topics: Mutex<HashMap<Uuid, broadcast::Sender<StatusUpdate>>>,
}

impl StatusEventBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one flow's updates.
    pub fn subscribe(&self, flow_id: Uuid) -> broadcast::Receiver<StatusUpdate> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(flow_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Number of live topics, for tests and introspection.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap().len()
    }
}

impl StatusEvents for StatusEventBus {
    fn publish(&self, update: StatusUpdate) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(sender) = topics.get(&update.flow_id) {
            if sender.receiver_count() == 0 {
                topics.remove(&update.flow_id);
                return;
            }
            trace!(flow_id = %update.flow_id, stage = %update.stage, "publishing status update");
            let _ = sender.send(update);
        }
    }
}
