use async_trait::async_trait;
use flowcore::{StepSpec, WorkflowDefinition, WorkflowError, WorkflowId};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

/// Supplies the ordered step list of a workflow
#[async_trait]
pub trait WorkflowProvider: Send + Sync {
    async fn ordered_steps(&self, workflow_id: WorkflowId) -> Result<Vec<StepSpec>, WorkflowError>;
}

/// In-memory catalog of workflow definitions
#[derive(Default)]
pub struct WorkflowCatalog {
    workflows: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow after checking that its steps can be ordered
    pub async fn register(&self, workflow: WorkflowDefinition) -> Result<WorkflowId, WorkflowError> {
        order_steps(&workflow)?;
        let id = workflow.id;
        tracing::info!("Registered workflow: {} ({})", workflow.name, id);
        self.workflows.write().await.insert(id, workflow);
        Ok(id)
    }

    pub async fn get(&self, id: WorkflowId) -> Option<WorkflowDefinition> {
        self.workflows.read().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<WorkflowDefinition> {
        let mut all: Vec<_> = self.workflows.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub async fn remove(&self, id: WorkflowId) -> Option<WorkflowDefinition> {
        self.workflows.write().await.remove(&id)
    }
}

#[async_trait]
impl WorkflowProvider for WorkflowCatalog {
    async fn ordered_steps(&self, workflow_id: WorkflowId) -> Result<Vec<StepSpec>, WorkflowError> {
        let workflows = self.workflows.read().await;
        let workflow = workflows
            .get(&workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        order_steps(workflow)
    }
}

/// Order steps so every step follows its dependencies.
///
/// Steps whose dependencies are met run in declaration order.
pub fn order_steps(workflow: &WorkflowDefinition) -> Result<Vec<StepSpec>, WorkflowError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

    // Nodes are added in declaration order, so NodeIndex order is declaration order
    for (position, step) in workflow.steps.iter().enumerate() {
        let idx = graph.add_node(position);
        if index_of.insert(step.id.as_str(), idx).is_some() {
            return Err(WorkflowError::DuplicateStep(step.id.clone()));
        }
    }

    for step in &workflow.steps {
        let to = index_of[step.id.as_str()];
        for dependency in &step.depends_on {
            let from = index_of.get(dependency.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency {
                    step: step.id.clone(),
                    depends_on: dependency.clone(),
                }
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(WorkflowError::CyclicDependency);
    }

    let mut remaining: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
        .collect();
    let mut ready: BTreeSet<NodeIndex> = remaining
        .iter()
        .filter(|(_, deps)| **deps == 0)
        .map(|(idx, _)| *idx)
        .collect();

    let mut ordered = Vec::with_capacity(workflow.steps.len());
    while let Some(idx) = ready.pop_first() {
        ordered.push(workflow.steps[graph[idx]].clone());
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            if let Some(deps) = remaining.get_mut(&next) {
                *deps -= 1;
                if *deps == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    Ok(ordered)
}
