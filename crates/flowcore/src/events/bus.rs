use crate::{ExecutionId, ProgressEvent};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// Topic-based broadcast of progress events
///
/// Every event goes to the global topic and to the topic of its execution.
/// Execution topics are created on first subscription and dropped with
/// [`close_topic`](Self::close_topic), which ends the stream for their
/// subscribers once buffered events are drained.
pub struct EventBus {
    global: broadcast::Sender<ProgressEvent>,
    topics: RwLock<HashMap<ExecutionId, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (global, _) = broadcast::channel(capacity);
        Self {
            global,
            topics: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to events of every execution
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.global.subscribe()
    }

    /// Subscribe to events of a single execution
    pub async fn subscribe_execution(&self, execution_id: ExecutionId) -> broadcast::Receiver<ProgressEvent> {
        let mut topics = self.topics.write().await;
        topics
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Broadcast an event, returning how many subscribers received it
    pub async fn publish(&self, event: ProgressEvent) -> usize {
        let scoped = {
            let topics = self.topics.read().await;
            topics
                .get(&event.execution_id)
                .and_then(|sender| sender.send(event.clone()).ok())
                .unwrap_or(0)
        };
        let global = self.global.send(event).unwrap_or(0);
        scoped + global
    }

    /// Drop the topic of a finished execution
    pub async fn close_topic(&self, execution_id: ExecutionId) {
        self.topics.write().await.remove(&execution_id);
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}
