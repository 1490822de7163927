use crate::{EventSink, ExecutionEvent, ExecutionId, StepError, StepId, StepSpec, Variables};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Runs one step of a workflow against the current variable context.
///
/// Timeouts and retries are the executor's own business; any error it
/// returns fails the execution.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &StepSpec, ctx: StepContext) -> Result<StepOutput, StepError>;
}

/// Implementation of a single step type (e.g., "debug.log", "time.delay")
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Unique type identifier matched against `StepSpec::step_type`
    fn step_type(&self) -> &str;

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError>;

    /// Optional: Validate configuration at workflow registration time
    fn validate_config(&self, _config: &Variables) -> Result<(), StepError> {
        Ok(())
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata::default()
    }
}

/// Metadata about a step type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetadata {
    pub description: String,
    pub category: String,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Execution context passed to each step
#[derive(Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub step_id: StepId,

    /// Static configuration for this step
    pub config: Variables,

    /// Copy of the execution variables at dispatch time
    pub variables: Variables,

    /// Event emitter for real-time updates
    pub events: StepEmitter,
}

impl StepContext {
    /// Get required config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, StepError> {
        self.config
            .get(name)
            .ok_or_else(|| StepError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get a variable or return error
    pub fn require_variable(&self, name: &str) -> Result<&Value, StepError> {
        self.variables
            .get(name)
            .ok_or_else(|| StepError::MissingInput(name.to_string()))
    }

    /// Resolve a dotted path such as `fetch.body.items` against the variables
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.variables.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Output from step execution, stored under the step id in the variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub values: Variables,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }
}

impl From<Variables> for StepOutput {
    fn from(values: Variables) -> Self {
        Self { values }
    }
}

/// Event emitter bound to one step of one execution
#[derive(Clone)]
pub struct StepEmitter {
    execution_id: ExecutionId,
    step_id: StepId,
    sink: Arc<dyn EventSink>,
}

impl StepEmitter {
    pub fn new(execution_id: ExecutionId, step_id: impl Into<StepId>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            sink,
        }
    }

    pub async fn variable_updated(&self, key: &str, value: &Value) {
        self.sink
            .publish(ExecutionEvent::variable_updated(self.execution_id, &self.step_id, key, value))
            .await;
    }

    pub async fn human_review_requested(&self, request: Variables) {
        self.sink
            .publish(ExecutionEvent::human_review_requested(self.execution_id, &self.step_id, request))
            .await;
    }

    pub async fn human_review_approved(&self, reviewer: &str) {
        self.sink
            .publish(ExecutionEvent::human_review_approved(self.execution_id, &self.step_id, reviewer))
            .await;
    }

    pub async fn human_review_rejected(&self, reviewer: &str, reason: &str) {
        self.sink
            .publish(ExecutionEvent::human_review_rejected(
                self.execution_id,
                &self.step_id,
                reviewer,
                reason,
            ))
            .await;
    }
}
