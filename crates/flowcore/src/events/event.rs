use crate::{ExecutionId, ExecutionStatus, StepSpec, Variables, WorkflowId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of lifecycle or step event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionPaused,
    ExecutionResumed,
    ExecutionCancelled,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    VariableUpdated,
    HumanReviewRequested,
    HumanReviewApproved,
    HumanReviewRejected,
}

impl EventType {
    pub fn is_step_event(&self) -> bool {
        matches!(
            self,
            Self::StepStarted | Self::StepCompleted | Self::StepFailed | Self::StepSkipped
        )
    }

    /// Events that close an execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted | Self::ExecutionFailed | Self::ExecutionCancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionPaused => "execution_paused",
            Self::ExecutionResumed => "execution_resumed",
            Self::ExecutionCancelled => "execution_cancelled",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepSkipped => "step_skipped",
            Self::VariableUpdated => "variable_updated",
            Self::HumanReviewRequested => "human_review_requested",
            Self::HumanReviewApproved => "human_review_approved",
            Self::HumanReviewRejected => "human_review_rejected",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
    }
}

/// Immutable row of the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub event_type: EventType,
    pub step_id: Option<String>,
    pub step_type: Option<String>,
    pub payload: Variables,
    pub duration_ms: Option<u64>,
    pub inserted_at: DateTime<Utc>,
}

fn payload(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        _ => Variables::new(),
    }
}

impl ExecutionEvent {
    fn new(execution_id: ExecutionId, event_type: EventType, payload: Variables) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            event_type,
            step_id: None,
            step_type: None,
            payload,
            duration_ms: None,
            inserted_at: Utc::now(),
        }
    }

    fn for_step(mut self, step: &StepSpec) -> Self {
        self.step_id = Some(step.id.clone());
        self.step_type = Some(step.step_type.clone());
        self
    }

    pub fn execution_started(execution_id: ExecutionId, workflow_id: WorkflowId, recovered: bool) -> Self {
        Self::new(
            execution_id,
            EventType::ExecutionStarted,
            payload(json!({ "workflow_id": workflow_id, "recovered": recovered })),
        )
    }

    pub fn execution_paused(execution_id: ExecutionId, step_cursor: Option<&str>) -> Self {
        Self::new(
            execution_id,
            EventType::ExecutionPaused,
            payload(json!({ "step_cursor": step_cursor })),
        )
    }

    pub fn execution_resumed(execution_id: ExecutionId) -> Self {
        Self::new(execution_id, EventType::ExecutionResumed, Variables::new())
    }

    pub fn execution_completed(execution_id: ExecutionId, output: &Variables, duration_ms: Option<u64>) -> Self {
        let mut event = Self::new(
            execution_id,
            EventType::ExecutionCompleted,
            payload(json!({ "status": ExecutionStatus::Completed, "output": output })),
        );
        event.duration_ms = duration_ms;
        event
    }

    pub fn execution_failed(
        execution_id: ExecutionId,
        message: &str,
        step_id: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Self {
        let mut event = Self::new(
            execution_id,
            EventType::ExecutionFailed,
            payload(json!({
                "status": ExecutionStatus::Failed,
                "error_message": message,
                "error_step_id": step_id,
            })),
        );
        event.step_id = step_id.map(str::to_string);
        event.duration_ms = duration_ms;
        event
    }

    pub fn execution_cancelled(execution_id: ExecutionId, step_cursor: Option<&str>, duration_ms: Option<u64>) -> Self {
        let mut event = Self::new(
            execution_id,
            EventType::ExecutionCancelled,
            payload(json!({ "status": ExecutionStatus::Cancelled, "step_cursor": step_cursor })),
        );
        event.duration_ms = duration_ms;
        event
    }

    pub fn step_started(execution_id: ExecutionId, step: &StepSpec) -> Self {
        Self::new(
            execution_id,
            EventType::StepStarted,
            payload(json!({ "name": step.display_name() })),
        )
        .for_step(step)
    }

    pub fn step_completed(execution_id: ExecutionId, step: &StepSpec, output: &Value, duration_ms: u64) -> Self {
        let mut event = Self::new(
            execution_id,
            EventType::StepCompleted,
            payload(json!({ "output": output })),
        )
        .for_step(step);
        event.duration_ms = Some(duration_ms);
        event
    }

    pub fn step_failed(execution_id: ExecutionId, step: &StepSpec, error: &str, duration_ms: u64) -> Self {
        let mut event = Self::new(
            execution_id,
            EventType::StepFailed,
            payload(json!({ "error": error })),
        )
        .for_step(step);
        event.duration_ms = Some(duration_ms);
        event
    }

    pub fn step_skipped(execution_id: ExecutionId, step: &StepSpec, reason: &str) -> Self {
        Self::new(
            execution_id,
            EventType::StepSkipped,
            payload(json!({ "reason": reason })),
        )
        .for_step(step)
    }

    pub fn variable_updated(execution_id: ExecutionId, step_id: &str, key: &str, value: &Value) -> Self {
        let mut event = Self::new(
            execution_id,
            EventType::VariableUpdated,
            payload(json!({ "key": key, "value": value })),
        );
        event.step_id = Some(step_id.to_string());
        event
    }

    pub fn human_review_requested(execution_id: ExecutionId, step_id: &str, request: Variables) -> Self {
        let mut event = Self::new(execution_id, EventType::HumanReviewRequested, request);
        event.step_id = Some(step_id.to_string());
        event
    }

    pub fn human_review_approved(execution_id: ExecutionId, step_id: &str, reviewer: &str) -> Self {
        let mut event = Self::new(
            execution_id,
            EventType::HumanReviewApproved,
            payload(json!({ "reviewer": reviewer })),
        );
        event.step_id = Some(step_id.to_string());
        event
    }

    pub fn human_review_rejected(execution_id: ExecutionId, step_id: &str, reviewer: &str, reason: &str) -> Self {
        let mut event = Self::new(
            execution_id,
            EventType::HumanReviewRejected,
            payload(json!({ "reviewer": reviewer, "reason": reason })),
        );
        event.step_id = Some(step_id.to_string());
        event
    }

    /// Broadcast shape of this event
    pub fn to_progress(&self) -> ProgressEvent {
        ProgressEvent {
            event_id: self.id,
            execution_id: self.execution_id,
            event_type: self.event_type,
            step_id: self.step_id.clone(),
            payload: self.payload.clone(),
            timestamp: self.inserted_at,
        }
    }
}

/// Message delivered to live subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_id: Uuid,
    pub execution_id: ExecutionId,
    pub event_type: EventType,
    pub step_id: Option<String>,
    pub payload: Variables,
    pub timestamp: DateTime<Utc>,
}

/// Destination for execution events emitted from inside a step
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: ExecutionEvent);
}
