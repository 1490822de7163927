use crate::{StepId, StoreError, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Variable map carried through an execution
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Persisted status of an execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
    }
}

/// A status change requested against the execution record
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start,
    Pause,
    Resume,
    Complete { output: Variables },
    Fail { message: String, step_id: Option<StepId> },
    Cancel,
}

impl Transition {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
            Self::Cancel => "cancel",
        }
    }

    fn allowed_from(&self, status: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match self {
            // A recovered worker re-enters a run that is still marked running
            Self::Start => matches!(status, Queued | Running),
            Self::Pause => status == Running,
            Self::Resume => status == Paused,
            Self::Complete { .. } => status == Running,
            Self::Fail { .. } | Self::Cancel => !status.is_terminal(),
        }
    }
}

/// Point-in-time copy of runtime state, persisted for crash recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub variables: Variables,
    pub step_cursor: Option<StepId>,
    pub completed_steps: Vec<StepId>,
    pub failed_steps: Vec<StepId>,
    pub taken_at: DateTime<Utc>,
}

/// Durable record of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub account_id: String,
    pub status: ExecutionStatus,
    pub input_data: Variables,
    pub output_data: Option<Variables>,
    pub context_snapshot: Option<ContextSnapshot>,
    pub current_step_id: Option<StepId>,
    pub completed_step_ids: Vec<StepId>,
    pub failed_step_ids: Vec<StepId>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_step_id: Option<StepId>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Create a queued execution for a workflow run request
    pub fn new(workflow_id: WorkflowId, account_id: impl Into<String>, input_data: Variables) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            account_id: account_id.into(),
            status: ExecutionStatus::Queued,
            input_data,
            output_data: None,
            context_snapshot: None,
            current_step_id: None,
            completed_step_ids: Vec::new(),
            failed_step_ids: Vec::new(),
            started_at: None,
            paused_at: None,
            completed_at: None,
            error_message: None,
            error_step_id: None,
            inserted_at: now,
            updated_at: now,
        }
    }

    /// Apply a guarded status transition
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<(), StoreError> {
        if !transition.allowed_from(self.status) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                action: transition.action(),
            });
        }

        match transition {
            Transition::Start => {
                self.status = ExecutionStatus::Running;
                self.started_at.get_or_insert(now);
                self.paused_at = None;
            }
            Transition::Pause => {
                self.status = ExecutionStatus::Paused;
                self.paused_at = Some(now);
            }
            Transition::Resume => {
                self.status = ExecutionStatus::Running;
                self.paused_at = None;
            }
            Transition::Complete { output } => {
                self.status = ExecutionStatus::Completed;
                self.output_data = Some(output);
                self.completed_at = Some(now);
            }
            Transition::Fail { message, step_id } => {
                self.status = ExecutionStatus::Failed;
                self.error_message = Some(message);
                self.error_step_id = step_id;
                self.completed_at = Some(now);
            }
            Transition::Cancel => {
                self.status = ExecutionStatus::Cancelled;
                self.completed_at = Some(now);
            }
        }

        self.updated_at = now;
        Ok(())
    }

    /// Record a runtime snapshot. Terminal records are immutable.
    pub fn record_snapshot(&mut self, snapshot: ContextSnapshot) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                action: "snapshot",
            });
        }

        self.current_step_id = snapshot.step_cursor.clone();
        self.completed_step_ids = snapshot.completed_steps.clone();
        self.failed_step_ids = snapshot.failed_steps.clone();
        self.updated_at = snapshot.taken_at;
        self.context_snapshot = Some(snapshot);
        Ok(())
    }
}
