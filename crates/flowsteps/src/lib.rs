//! Standard step library
//!
//! Collection of built-in step handlers for common operations

mod debug;
mod time;
mod transform;
mod vars;

pub use debug::DebugStep;
pub use time::DelayStep;
pub use transform::{JsonParseStep, JsonStringifyStep};
pub use vars::SetVariablesStep;

use flowcore::{StepContext, StepError};
use flowexec::StepRegistry;
use serde_json::Value;
use std::sync::Arc;

/// Register all standard steps with a registry
pub fn register_all(registry: &mut StepRegistry) {
    registry.register(Arc::new(DebugStep));
    registry.register(Arc::new(DelayStep));
    registry.register(Arc::new(JsonParseStep));
    registry.register(Arc::new(JsonStringifyStep));
    registry.register(Arc::new(SetVariablesStep));
}

/// Registry preloaded with the standard steps
pub fn standard_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    register_all(&mut registry);
    registry
}

/// Value of a step input: a variable path under `from`, or a literal under `key`
fn input<'a>(ctx: &'a StepContext, key: &str) -> Result<&'a Value, StepError> {
    match ctx.config.get("from").and_then(Value::as_str) {
        Some(path) => ctx
            .lookup(path)
            .ok_or_else(|| StepError::MissingInput(path.to_string())),
        None => ctx.require_config(key),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
