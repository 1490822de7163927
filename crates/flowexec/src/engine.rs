use crate::catalog::WorkflowCatalog;
use crate::config::EngineConfig;
use crate::process::{ProcessDeps, ProcessHandle, ProcessSnapshot};
use crate::publisher::ProgressPublisher;
use crate::registry::StepRegistry;
use crate::supervisor::Supervisor;
use flowcore::{
    CommandError, EventBus, EventLog, EventQuery, Execution, ExecutionEvent, ExecutionId,
    ExecutionStatus, ExecutionStore, FlowError, MemoryStore, ProgressEvent, StepExecutor,
    Variables, WorkflowDefinition, WorkflowError, WorkflowId,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Outcome of [`FlowEngine::recover`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Running executions restarted and executing again
    pub resumed: Vec<ExecutionId>,
    /// Paused executions brought back up, waiting for `resume`
    pub paused: Vec<ExecutionId>,
    pub failed: Vec<(ExecutionId, String)>,
}

/// Main entry point: workflow catalog, execution records and live workers
pub struct FlowEngine {
    config: EngineConfig,
    catalog: Arc<WorkflowCatalog>,
    steps: Arc<StepRegistry>,
    validate_steps: bool,
    store: Arc<dyn ExecutionStore>,
    log: Arc<dyn EventLog>,
    bus: Arc<EventBus>,
    supervisor: Arc<Supervisor>,
}

impl FlowEngine {
    /// Create an engine with default settings and in-memory storage
    pub fn new() -> Self {
        EngineBuilder::new().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Step types available to workflows
    pub fn steps(&self) -> &StepRegistry {
        &self.steps
    }

    /// Register a workflow, rejecting unknown step types and bad dependencies
    pub async fn register_workflow(&self, workflow: WorkflowDefinition) -> Result<WorkflowId, FlowError> {
        if self.validate_steps {
            self.steps.validate(&workflow)?;
        }
        Ok(self.catalog.register(workflow).await?)
    }

    pub async fn workflows(&self) -> Vec<WorkflowDefinition> {
        self.catalog.list().await
    }

    pub async fn workflow(&self, id: WorkflowId) -> Option<WorkflowDefinition> {
        self.catalog.get(id).await
    }

    /// Drop a workflow from the catalog; existing executions keep their records
    pub async fn remove_workflow(&self, id: WorkflowId) -> Option<WorkflowDefinition> {
        let removed = self.catalog.remove(id).await;
        if removed.is_some() {
            tracing::info!("Removed workflow {}", id);
        }
        removed
    }

    /// Create a queued execution record
    pub async fn create_execution(
        &self,
        workflow_id: WorkflowId,
        account_id: impl Into<String>,
        input_data: Variables,
    ) -> Result<Execution, FlowError> {
        if self.catalog.get(workflow_id).await.is_none() {
            return Err(WorkflowError::NotFound(workflow_id.to_string()).into());
        }
        let execution = self
            .store
            .create(Execution::new(workflow_id, account_id, input_data))
            .await?;
        tracing::info!("Created execution {} for workflow {}", execution.id, workflow_id);
        Ok(execution)
    }

    /// Start (or find) the worker of an execution
    pub async fn start_execution(&self, execution_id: ExecutionId) -> Result<ProcessHandle, FlowError> {
        self.supervisor.start(execution_id).await
    }

    /// Handle of the live worker of an execution
    pub async fn process(&self, execution_id: ExecutionId) -> Result<ProcessHandle, FlowError> {
        self.supervisor
            .lookup(execution_id)
            .await
            .ok_or_else(|| FlowError::from(CommandError::UnknownExecution(execution_id)))
    }

    pub async fn execute(&self, execution_id: ExecutionId) -> Result<(), FlowError> {
        self.process(execution_id).await?.execute().await
    }

    pub async fn pause(&self, execution_id: ExecutionId) -> Result<(), FlowError> {
        self.process(execution_id).await?.pause().await
    }

    pub async fn resume(&self, execution_id: ExecutionId) -> Result<(), FlowError> {
        self.process(execution_id).await?.resume().await
    }

    pub async fn stop(&self, execution_id: ExecutionId) -> Result<(), FlowError> {
        self.process(execution_id).await?.stop().await
    }

    pub async fn get_state(&self, execution_id: ExecutionId) -> Result<ProcessSnapshot, FlowError> {
        self.process(execution_id).await?.get_state().await
    }

    /// Progress of every execution
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.bus.subscribe()
    }

    /// Progress of one execution; the stream closes when it finishes
    pub async fn subscribe_execution(&self, execution_id: ExecutionId) -> broadcast::Receiver<ProgressEvent> {
        self.bus.subscribe_execution(execution_id).await
    }

    /// Progress of one execution, checked against its record
    ///
    /// The stream is already closed when the execution has finished, so a
    /// late subscriber does not wait forever for events that never come.
    pub async fn watch_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<broadcast::Receiver<ProgressEvent>, FlowError> {
        let events = self.bus.subscribe_execution(execution_id).await;
        match self.store.get(execution_id).await {
            Ok(record) if !record.status.is_terminal() => Ok(events),
            Ok(_) => {
                self.bus.close_topic(execution_id).await;
                Ok(events)
            }
            Err(e) => {
                self.bus.close_topic(execution_id).await;
                Err(e.into())
            }
        }
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<Execution, FlowError> {
        Ok(self.store.get(execution_id).await?)
    }

    pub async fn list_executions(&self, status: Option<ExecutionStatus>) -> Result<Vec<Execution>, FlowError> {
        let executions = match status {
            Some(status) => self.store.list_by_status(status).await?,
            None => self.store.list().await?,
        };
        Ok(executions)
    }

    pub async fn events(&self, query: &EventQuery) -> Result<Vec<ExecutionEvent>, FlowError> {
        Ok(self.log.query(query).await?)
    }

    pub async fn live_workers(&self) -> usize {
        self.supervisor.live_count().await
    }

    /// Bring back executions interrupted by a restart of the host process
    ///
    /// Running executions are started and executed again; paused ones are
    /// started and wait for `resume`.
    pub async fn recover(&self) -> Result<RecoveryReport, FlowError> {
        let mut report = RecoveryReport::default();

        for execution in self.store.list_by_status(ExecutionStatus::Running).await? {
            match self.start_and_execute(execution.id).await {
                Ok(()) => report.resumed.push(execution.id),
                Err(e) => {
                    tracing::warn!("Could not recover {}: {}", execution.id, e);
                    report.failed.push((execution.id, e.to_string()));
                }
            }
        }

        for execution in self.store.list_by_status(ExecutionStatus::Paused).await? {
            match self.start_execution(execution.id).await {
                Ok(_) => report.paused.push(execution.id),
                Err(e) => {
                    tracing::warn!("Could not recover {}: {}", execution.id, e);
                    report.failed.push((execution.id, e.to_string()));
                }
            }
        }

        tracing::info!(
            "Recovery: {} resumed, {} paused, {} failed",
            report.resumed.len(),
            report.paused.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Start and execute an execution, then wait for its terminal event
    pub async fn run_to_completion(&self, execution_id: ExecutionId) -> Result<Execution, FlowError> {
        let mut events = self.bus.subscribe_execution(execution_id).await;
        if let Err(e) = self.start_and_execute(execution_id).await {
            self.bus.close_topic(execution_id).await;
            return Err(e);
        }

        loop {
            match events.recv().await {
                Ok(event) if event.event_type.is_terminal() => break,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Progress stream for {} skipped {} events", execution_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        self.get_execution(execution_id).await
    }

    /// Abort all workers, leaving records as they are for a later `recover`
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    async fn start_and_execute(&self, execution_id: ExecutionId) -> Result<(), FlowError> {
        self.start_execution(execution_id).await?.execute().await
    }
}

impl Default for FlowEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`FlowEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    steps: StepRegistry,
    executor: Option<Arc<dyn StepExecutor>>,
    storage: Option<(Arc<dyn ExecutionStore>, Arc<dyn EventLog>)>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            steps: StepRegistry::new(),
            executor: None,
            storage: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Step handlers used to run steps and to validate workflows
    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    /// Run steps with a custom executor instead of the step registry.
    ///
    /// Workflows are then registered without step type validation.
    pub fn executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use one backend for both execution records and the event log
    pub fn storage<S>(mut self, storage: Arc<S>) -> Self
    where
        S: ExecutionStore + EventLog + 'static,
    {
        self.storage = Some((
            storage.clone() as Arc<dyn ExecutionStore>,
            storage as Arc<dyn EventLog>,
        ));
        self
    }

    pub fn build(self) -> FlowEngine {
        let steps = Arc::new(self.steps);
        let validate_steps = self.executor.is_none();
        let executor = self
            .executor
            .unwrap_or_else(|| steps.clone() as Arc<dyn StepExecutor>);

        let (store, log) = self.storage.unwrap_or_else(|| {
            let memory = Arc::new(MemoryStore::new());
            (
                memory.clone() as Arc<dyn ExecutionStore>,
                memory as Arc<dyn EventLog>,
            )
        });

        let bus = Arc::new(EventBus::new(self.config.event_buffer_size.max(1)));
        let catalog = Arc::new(WorkflowCatalog::new());
        let deps = ProcessDeps {
            store: store.clone(),
            workflows: catalog.clone(),
            executor,
            publisher: ProgressPublisher::new(bus.clone(), log.clone()),
            config: self.config.clone(),
        };

        tracing::debug!("Engine built with {:?}", self.config);

        FlowEngine {
            config: self.config,
            catalog,
            steps,
            validate_steps,
            store,
            log,
            bus,
            supervisor: Arc::new(Supervisor::new(deps)),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
