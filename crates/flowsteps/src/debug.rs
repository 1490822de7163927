use async_trait::async_trait;
use flowcore::{StepContext, StepError, StepHandler, StepMetadata, StepOutput};
use serde_json::Value;

/// Logs a message, and optionally a variable, for debugging
pub struct DebugStep;

#[async_trait]
impl StepHandler for DebugStep {
    fn step_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let message = ctx
            .config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("(no message)")
            .to_string();

        tracing::info!("[{}:{}] {}", ctx.execution_id, ctx.step_id, message);

        let mut output = StepOutput::new().with_output("message", message);
        if let Some(path) = ctx.config.get("path").and_then(Value::as_str) {
            let value = ctx.lookup(path).cloned().unwrap_or(Value::Null);
            tracing::info!("  {} = {}", path, value);
            output = output.with_output("value", value);
        }
        Ok(output)
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Logs a message and optionally a variable".to_string(),
            category: "debug".to_string(),
        }
    }
}
