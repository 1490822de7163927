//! Durable storage contracts for execution records and the event log

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::{
    ContextSnapshot, EventQuery, Execution, ExecutionEvent, ExecutionId, ExecutionStatus,
    StoreError, Transition,
};
use async_trait::async_trait;

/// One record per workflow run. Transitions are guarded writes.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new record; fails if the id is taken
    async fn create(&self, execution: Execution) -> Result<Execution, StoreError>;

    async fn get(&self, id: ExecutionId) -> Result<Execution, StoreError>;

    async fn list(&self) -> Result<Vec<Execution>, StoreError>;

    async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.status == status)
            .collect())
    }

    /// Apply a status transition, rejecting it if stale for the persisted status
    async fn transition(&self, id: ExecutionId, transition: Transition) -> Result<Execution, StoreError>;

    /// Overwrite the record's context snapshot and step columns
    async fn save_snapshot(&self, id: ExecutionId, snapshot: ContextSnapshot) -> Result<(), StoreError>;
}

/// Append-only, immutable event log
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: ExecutionEvent) -> Result<(), StoreError>;

    async fn query(&self, query: &EventQuery) -> Result<Vec<ExecutionEvent>, StoreError>;
}
