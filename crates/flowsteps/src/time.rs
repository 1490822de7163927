use async_trait::async_trait;
use flowcore::{StepContext, StepError, StepHandler, StepMetadata, StepOutput, Variables};
use serde_json::Value;
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Delay execution for a specified duration
pub struct DelayStep;

#[async_trait]
impl StepHandler for DelayStep {
    fn step_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let delay_ms = ctx
            .config
            .get("delay_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_DELAY_MS);

        tracing::debug!("Step {} delaying for {}ms", ctx.step_id, delay_ms);
        sleep(Duration::from_millis(delay_ms)).await;

        Ok(StepOutput::new().with_output("delayed_ms", delay_ms))
    }

    fn validate_config(&self, config: &Variables) -> Result<(), StepError> {
        match config.get("delay_ms") {
            None => Ok(()),
            Some(value) if value.is_u64() => Ok(()),
            Some(value) => Err(StepError::InvalidInputType {
                field: "delay_ms".to_string(),
                expected: "non-negative integer".to_string(),
                actual: crate::type_name(value).to_string(),
            }),
        }
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
        }
    }
}
