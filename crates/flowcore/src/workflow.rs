use crate::Variables;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type StepId = String;

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Generated when a submitted definition leaves it out
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkflowId,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    pub fn add_step(&mut self, step: StepSpec) -> StepId {
        let id = step.id.clone();
        self.steps.push(step);
        id
    }

    /// Builder form of [`add_step`](Self::add_step)
    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn find_step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Step descriptor handed to the step executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: StepId,
    pub step_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Variables,
    /// Steps that must complete before this one is scheduled
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl StepSpec {
    pub fn new(id: impl Into<StepId>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            name: None,
            config: Variables::new(),
            depends_on: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<StepId>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}
