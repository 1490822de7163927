use async_trait::async_trait;
use flowcore::{
    StepContext, StepError, StepExecutor, StepHandler, StepMetadata, StepOutput, StepSpec,
    WorkflowDefinition, WorkflowError,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available step types
///
/// Dispatches each step to the handler registered for its `step_type`.
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a step handler
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        let step_type = handler.step_type().to_string();
        tracing::info!("Registering step type: {}", step_type);
        self.handlers.insert(step_type, handler);
    }

    /// Get all registered step types, sorted
    pub fn list_step_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a step type
    pub fn get_metadata(&self, step_type: &str) -> Option<StepMetadata> {
        self.handlers.get(step_type).map(|h| h.metadata())
    }

    /// Check that every step of a workflow has a handler that accepts its config
    pub fn validate(&self, workflow: &WorkflowDefinition) -> Result<(), WorkflowError> {
        for step in &workflow.steps {
            let handler = self.handlers.get(&step.step_type).ok_or_else(|| {
                WorkflowError::Invalid(format!(
                    "step '{}' has unknown type '{}'",
                    step.id, step.step_type
                ))
            })?;
            handler
                .validate_config(&step.config)
                .map_err(|e| WorkflowError::Invalid(format!("step '{}': {}", step.id, e)))?;
        }
        Ok(())
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for StepRegistry {
    async fn execute(&self, step: &StepSpec, ctx: StepContext) -> Result<StepOutput, StepError> {
        let handler = self
            .handlers
            .get(&step.step_type)
            .ok_or_else(|| StepError::UnknownStepType(step.step_type.clone()))?;
        handler.execute(ctx).await
    }
}
