use async_trait::async_trait;
use flowcore::{StepContext, StepError, StepHandler, StepMetadata, StepOutput, Variables};
use serde_json::Value;

/// Publish a fixed set of values as this step's output
///
/// Each value is announced with a `variable_updated` event.
pub struct SetVariablesStep;

#[async_trait]
impl StepHandler for SetVariablesStep {
    fn step_type(&self) -> &str {
        "vars.set"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let values = match ctx.require_config("values")? {
            Value::Object(values) => values.clone(),
            other => {
                return Err(StepError::InvalidInputType {
                    field: "values".to_string(),
                    expected: "object".to_string(),
                    actual: crate::type_name(other).to_string(),
                })
            }
        };

        for (key, value) in &values {
            ctx.events.variable_updated(key, value).await;
        }

        Ok(StepOutput::from(values))
    }

    fn validate_config(&self, config: &Variables) -> Result<(), StepError> {
        match config.get("values") {
            Some(Value::Object(_)) => Ok(()),
            Some(other) => Err(StepError::InvalidInputType {
                field: "values".to_string(),
                expected: "object".to_string(),
                actual: crate::type_name(other).to_string(),
            }),
            None => Err(StepError::Configuration("Missing config: values".to_string())),
        }
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Set named values and announce each update".to_string(),
            category: "variables".to_string(),
        }
    }
}
