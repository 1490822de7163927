use crate::{ExecutionId, ExecutionStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Command rejected: {0}")]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned by a step executor. Any of these fails the execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    ExecutionFailed(String),

    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{depends_on}'")]
    UnknownDependency { step: String, depends_on: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Execution already exists: {0}")]
    AlreadyExists(ExecutionId),

    #[error("Cannot {action} execution {id} while {from}")]
    InvalidTransition {
        id: ExecutionId,
        from: ExecutionStatus,
        action: &'static str,
    },

    #[error("No snapshot recorded for execution {0}")]
    SnapshotNotFound(ExecutionId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Rejection of a control command. Fatal only to the call that issued it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("No live worker for execution {0}")]
    UnknownExecution(ExecutionId),

    #[error("Cannot {command} while {status}")]
    InvalidState { command: &'static str, status: String },

    #[error("Execution {0} has already finished")]
    AlreadyFinished(ExecutionId),

    #[error("Worker for execution {0} is not responding")]
    WorkerUnavailable(ExecutionId),
}
