use crate::{input, type_name};
use async_trait::async_trait;
use flowcore::{StepContext, StepError, StepHandler, StepMetadata, StepOutput};

/// Parse a JSON string into a value
pub struct JsonParseStep;

#[async_trait]
impl StepHandler for JsonParseStep {
    fn step_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let value = input(&ctx, "json")?;
        let text = value.as_str().ok_or_else(|| StepError::InvalidInputType {
            field: "json".to_string(),
            expected: "string".to_string(),
            actual: type_name(value).to_string(),
        })?;

        let parsed: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| StepError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(StepOutput::new().with_output("parsed", parsed))
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}

/// Serialize a value to a JSON string
pub struct JsonStringifyStep;

#[async_trait]
impl StepHandler for JsonStringifyStep {
    fn step_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let value = input(&ctx, "value")?;

        let json = serde_json::to_string(value)
            .map_err(|e| StepError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(StepOutput::new().with_output("json", json))
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}
