use super::{EventLog, ExecutionStore};
use crate::{
    ContextSnapshot, EventQuery, Execution, ExecutionEvent, ExecutionId, StoreError, Transition,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process store for tests and embedded use
#[derive(Default)]
pub struct MemoryStore {
    executions: RwLock<HashMap<ExecutionId, Execution>>,
    events: RwLock<Vec<ExecutionEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create(&self, execution: Execution) -> Result<Execution, StoreError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(StoreError::AlreadyExists(execution.id));
        }
        executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get(&self, id: ExecutionId) -> Result<Execution, StoreError> {
        self.executions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn list(&self) -> Result<Vec<Execution>, StoreError> {
        let mut all: Vec<_> = self.executions.read().await.values().cloned().collect();
        all.sort_by_key(|e| e.inserted_at);
        Ok(all)
    }

    async fn transition(&self, id: ExecutionId, transition: Transition) -> Result<Execution, StoreError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        execution.apply(transition, Utc::now())?;
        Ok(execution.clone())
    }

    async fn save_snapshot(&self, id: ExecutionId, snapshot: ContextSnapshot) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?
            .record_snapshot(snapshot)
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(&self, event: ExecutionEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<ExecutionEvent>, StoreError> {
        let events = self.events.read().await;
        Ok(query.apply(events.iter().filter(|e| query.matches(e)).cloned()))
    }
}
