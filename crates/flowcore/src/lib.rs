//! Core abstractions for the flow execution engine
//!
//! This crate provides the execution record, the event model and bus, the
//! storage contracts with their backends, and the step executor traits that
//! the engine and step libraries build on.

mod error;
pub mod events;
mod execution;
mod step;
pub mod store;
mod workflow;

pub use error::{CommandError, FlowError, StepError, StoreError, WorkflowError};
pub use events::*;
pub use execution::{
    ContextSnapshot, Execution, ExecutionId, ExecutionStatus, Transition, Variables,
};
pub use step::{StepContext, StepEmitter, StepExecutor, StepHandler, StepMetadata, StepOutput};
pub use store::{EventLog, ExecutionStore, FileStore, MemoryStore};
pub use workflow::{StepId, StepSpec, WorkflowDefinition, WorkflowId};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
