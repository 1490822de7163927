use async_trait::async_trait;
use flowcore::{EventBus, EventLog, EventSink, ExecutionEvent};
use std::sync::Arc;

/// Fans every event out to live subscribers and to the event log
///
/// The two paths are independent: a failed append is logged and the
/// broadcast is not held back or retried.
#[derive(Clone)]
pub struct ProgressPublisher {
    bus: Arc<EventBus>,
    log: Arc<dyn EventLog>,
}

impl ProgressPublisher {
    pub fn new(bus: Arc<EventBus>, log: Arc<dyn EventLog>) -> Self {
        Self { bus, log }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub async fn publish(&self, event: ExecutionEvent) {
        let reached = self.bus.publish(event.to_progress()).await;
        tracing::debug!(
            "Broadcast {} for {} to {} subscribers",
            event.event_type,
            event.execution_id,
            reached
        );

        let (event_type, execution_id) = (event.event_type, event.execution_id);
        if let Err(e) = self.log.append(event).await {
            tracing::error!("Failed to persist {} for {}: {}", event_type, execution_id, e);
        }
    }
}

#[async_trait]
impl EventSink for ProgressPublisher {
    async fn publish(&self, event: ExecutionEvent) {
        ProgressPublisher::publish(self, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::{EventQuery, EventType, MemoryStore, StoreError};
    use uuid::Uuid;

    struct BrokenLog;

    #[async_trait]
    impl EventLog for BrokenLog {
        async fn append(&self, _event: ExecutionEvent) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }

        async fn query(&self, _query: &EventQuery) -> Result<Vec<ExecutionEvent>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_bus_and_log() {
        let bus = Arc::new(EventBus::new(8));
        let store = Arc::new(MemoryStore::new());
        let publisher = ProgressPublisher::new(bus.clone(), store.clone());
        let id = Uuid::new_v4();
        let mut rx = bus.subscribe_execution(id).await;

        let event = ExecutionEvent::execution_resumed(id);
        publisher.publish(event.clone()).await;

        assert_eq!(rx.recv().await.unwrap().event_id, event.id);
        let logged = store.query(&EventQuery::for_execution(id)).await.unwrap();
        assert_eq!(logged, vec![event]);
    }

    #[tokio::test]
    async fn test_failed_append_still_broadcasts() {
        let bus = Arc::new(EventBus::new(8));
        let publisher = ProgressPublisher::new(bus.clone(), Arc::new(BrokenLog));
        let mut rx = bus.subscribe();

        publisher
            .publish(ExecutionEvent::execution_resumed(Uuid::new_v4()))
            .await;
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::ExecutionResumed);
    }
}
