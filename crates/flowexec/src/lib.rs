//! Workflow execution engine
//!
//! Runs each execution in its own supervised worker: a tokio task that owns
//! the execution's runtime state, answers control commands, and drives a
//! detached step loop. Progress is broadcast live and appended to the event
//! log; runtime state is snapshotted into the execution record so a crashed
//! or restarted worker picks up where the last snapshot left off.

mod catalog;
mod config;
mod engine;
mod loader;
mod process;
mod publisher;
mod registry;
mod runtime_state;
mod step_loop;
mod supervisor;

pub use catalog::{order_steps, WorkflowCatalog, WorkflowProvider};
pub use config::{EngineConfig, SnapshotPolicy};
pub use engine::{EngineBuilder, FlowEngine, RecoveryReport};
pub use loader::WorkflowLoader;
pub use process::{ProcessDeps, ProcessHandle, ProcessSnapshot, ProcessStatus};
pub use publisher::ProgressPublisher;
pub use registry::StepRegistry;
pub use runtime_state::RuntimeState;
pub use supervisor::Supervisor;
