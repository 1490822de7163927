use chrono::Utc;
use flowcore::{
    ContextSnapshot, ExecutionId, ExecutionStore, StepId, StoreError, Variables,
};
use serde_json::Value;

/// Ephemeral mutable state of one execution
///
/// Owned by the execution's worker while it is alive. Step outputs live in
/// `variables` under the id of the step that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeState {
    execution_id: ExecutionId,
    variables: Variables,
    step_cursor: Option<StepId>,
    completed_steps: Vec<StepId>,
    failed_steps: Vec<StepId>,
}

impl RuntimeState {
    /// Fresh state seeded with the execution's input data
    pub fn new(execution_id: ExecutionId, input_data: Variables) -> Self {
        Self {
            execution_id,
            variables: input_data,
            step_cursor: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
        }
    }

    /// Rebuild state from the last snapshot recorded for an execution
    pub async fn restore(execution_id: ExecutionId, store: &dyn ExecutionStore) -> Result<Self, StoreError> {
        let execution = store.get(execution_id).await?;
        execution
            .context_snapshot
            .map(|snapshot| Self::from_snapshot(execution_id, snapshot))
            .ok_or(StoreError::SnapshotNotFound(execution_id))
    }

    pub fn from_snapshot(execution_id: ExecutionId, snapshot: ContextSnapshot) -> Self {
        Self {
            execution_id,
            variables: snapshot.variables,
            step_cursor: snapshot.step_cursor,
            completed_steps: snapshot.completed_steps,
            failed_steps: snapshot.failed_steps,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn set_step_cursor(&mut self, step_id: impl Into<StepId>) {
        self.step_cursor = Some(step_id.into());
    }

    pub fn step_cursor(&self) -> Option<&str> {
        self.step_cursor.as_deref()
    }

    /// Store a step's output under its own key, replacing only that step's previous entry
    pub fn store_step_output(&mut self, step_id: &str, output: Value) {
        self.variables.insert(step_id.to_string(), output);
    }

    pub fn mark_step_completed(&mut self, step_id: &str) {
        if !self.is_completed(step_id) {
            self.completed_steps.push(step_id.to_string());
        }
    }

    pub fn mark_step_failed(&mut self, step_id: &str) {
        if !self.failed_steps.iter().any(|s| s == step_id) {
            self.failed_steps.push(step_id.to_string());
        }
    }

    pub fn get_variables(&self) -> &Variables {
        &self.variables
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_id)
    }

    pub fn completed_steps(&self) -> &[StepId] {
        &self.completed_steps
    }

    pub fn failed_steps(&self) -> &[StepId] {
        &self.failed_steps
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            variables: self.variables.clone(),
            step_cursor: self.step_cursor.clone(),
            completed_steps: self.completed_steps.clone(),
            failed_steps: self.failed_steps.clone(),
            taken_at: Utc::now(),
        }
    }

    /// Persist the current state into the execution record
    pub async fn force_snapshot(&self, store: &dyn ExecutionStore) -> Result<(), StoreError> {
        store.save_snapshot(self.execution_id, self.snapshot()).await?;
        tracing::debug!(
            "Snapshot saved for {} ({} steps completed)",
            self.execution_id,
            self.completed_steps.len()
        );
        Ok(())
    }

    /// Release the state, handing back the final variables
    pub fn cleanup(self) -> Variables {
        tracing::debug!("Released runtime state for {}", self.execution_id);
        self.variables
    }
}
