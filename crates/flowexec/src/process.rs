use crate::catalog::WorkflowProvider;
use crate::config::EngineConfig;
use crate::publisher::ProgressPublisher;
use crate::runtime_state::RuntimeState;
use crate::step_loop;
use async_trait::async_trait;
use flowcore::{
    CommandError, ContextSnapshot, EventSink, ExecutionEvent, ExecutionId, ExecutionStatus,
    ExecutionStore, FlowError, StepExecutor, StepId, StepSpec, StoreError, Transition, Variables,
    WorkflowId,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

/// Worker-side status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Paused,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic view of a live worker, returned by `get_state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ProcessStatus,
    pub step_cursor: Option<StepId>,
    pub completed_steps: Vec<StepId>,
    pub failed_steps: Vec<StepId>,
    pub remaining_steps: Vec<StepId>,
    pub variables: Variables,
    pub loop_active: bool,
    pub restarts: u32,
}

/// What the step loop should do at its next checkpoint.
///
/// Written by the worker on pause/resume/stop and by the loop itself when it
/// commits to finishing; a pause can only be raised while the value is `Run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    Run,
    Pause,
    /// A stop is being persisted
    Cancel,
    /// The record is cancelled and `execution_cancelled` is out
    Cancelled,
    Finishing,
}

impl Directive {
    pub(crate) fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel | Self::Cancelled)
    }
}

type Reply<T> = oneshot::Sender<Result<T, FlowError>>;

pub(crate) enum Command {
    Execute(Reply<()>),
    Pause(Reply<()>),
    Resume(Reply<()>),
    Stop(Reply<()>),
    GetState(Reply<ProcessSnapshot>),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Execute(_) => "execute",
            Self::Pause(_) => "pause",
            Self::Resume(_) => "resume",
            Self::Stop(_) => "stop",
            Self::GetState(_) => "get_state",
        }
    }
}

/// Address of the live worker of one execution
///
/// Two handles are equal when they point at the same worker.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    execution_id: ExecutionId,
    worker_id: Uuid,
    commands: mpsc::Sender<Command>,
}

impl PartialEq for ProcessHandle {
    fn eq(&self, other: &Self) -> bool {
        self.worker_id == other.worker_id
    }
}

impl Eq for ProcessHandle {}

impl ProcessHandle {
    pub(crate) fn new(execution_id: ExecutionId, commands: mpsc::Sender<Command>) -> Self {
        Self {
            execution_id,
            worker_id: Uuid::new_v4(),
            commands,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Launch the step loop
    pub async fn execute(&self) -> Result<(), FlowError> {
        self.request(Command::Execute).await
    }

    pub async fn pause(&self) -> Result<(), FlowError> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), FlowError> {
        self.request(Command::Resume).await
    }

    /// Cancel the execution; the record is cancelled once this returns `Ok`
    pub async fn stop(&self) -> Result<(), FlowError> {
        self.request(Command::Stop).await
    }

    pub async fn get_state(&self) -> Result<ProcessSnapshot, FlowError> {
        self.request(Command::GetState).await
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, FlowError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CommandError::WorkerUnavailable(self.execution_id))?;
        response
            .await
            .map_err(|_| CommandError::WorkerUnavailable(self.execution_id))?
    }
}

/// Collaborators every worker needs
#[derive(Clone)]
pub struct ProcessDeps {
    pub store: Arc<dyn ExecutionStore>,
    pub workflows: Arc<dyn WorkflowProvider>,
    pub executor: Arc<dyn StepExecutor>,
    pub publisher: ProgressPublisher,
    pub config: EngineConfig,
}

/// State shared between a worker and its step loop
pub(crate) struct ProcessContext {
    pub(crate) execution_id: ExecutionId,
    pub(crate) workflow_id: WorkflowId,
    pub(crate) deps: ProcessDeps,
    pub(crate) restarts: u32,
    pub(crate) runtime: Mutex<Option<RuntimeState>>,
    pub(crate) queue: Mutex<VecDeque<StepSpec>>,
    pub(crate) status: RwLock<ProcessStatus>,
    pub(crate) directive: watch::Sender<Directive>,
    retired: Mutex<Option<ContextSnapshot>>,
    emit_lock: Mutex<()>,
}

impl ProcessContext {
    /// Publish an event for this execution.
    ///
    /// Serialized per execution and stamped under the lock, so broadcast
    /// order, log order and timestamps agree.
    pub(crate) async fn emit(&self, mut event: ExecutionEvent) {
        let _guard = self.emit_lock.lock().await;
        event.inserted_at = chrono::Utc::now();
        self.deps.publisher.publish(event).await;
    }

    /// Publish a step-level event unless the cancel is already recorded.
    ///
    /// Checked under the emit lock, so nothing the loop emits can land after
    /// `execution_cancelled`.
    pub(crate) async fn emit_step(&self, mut event: ExecutionEvent) -> bool {
        let _guard = self.emit_lock.lock().await;
        if *self.directive.borrow() == Directive::Cancelled {
            return false;
        }
        event.inserted_at = chrono::Utc::now();
        self.deps.publisher.publish(event).await;
        true
    }

    /// Publish `execution_cancelled` and mark the cancel recorded in one step
    async fn record_cancel(&self, mut event: ExecutionEvent) {
        let _guard = self.emit_lock.lock().await;
        event.inserted_at = chrono::Utc::now();
        self.deps.publisher.publish(event).await;
        self.directive.send_replace(Directive::Cancelled);
    }

    pub(crate) async fn set_status(&self, status: ProcessStatus) {
        *self.status.write().await = status;
    }

    pub(crate) async fn step_cursor(&self) -> Option<StepId> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .and_then(|state| state.step_cursor().map(str::to_string))
    }

    /// Persist the runtime state; failures are logged
    pub(crate) async fn save_snapshot(&self) {
        let state = self.runtime.lock().await.clone();
        if let Some(state) = state {
            if let Err(e) = state.force_snapshot(self.deps.store.as_ref()).await {
                tracing::error!("Failed to snapshot execution {}: {}", self.execution_id, e);
            }
        }
    }

    /// Drop the runtime state, keeping a final copy for diagnostics
    pub(crate) async fn release(&self) {
        let mut runtime = self.runtime.lock().await;
        if let Some(state) = runtime.take() {
            *self.retired.lock().await = Some(state.snapshot());
            state.cleanup();
        }
    }

    async fn describe(&self, loop_active: bool) -> ProcessSnapshot {
        let status = *self.status.read().await;
        let remaining_steps = self.queue.lock().await.iter().map(|s| s.id.clone()).collect();
        let (step_cursor, completed_steps, failed_steps, variables) =
            match self.runtime.lock().await.as_ref() {
                Some(state) => (
                    state.step_cursor().map(str::to_string),
                    state.completed_steps().to_vec(),
                    state.failed_steps().to_vec(),
                    state.get_variables().clone(),
                ),
                None => match self.retired.lock().await.clone() {
                    Some(last) => (
                        last.step_cursor,
                        last.completed_steps,
                        last.failed_steps,
                        last.variables,
                    ),
                    None => (None, Vec::new(), Vec::new(), Variables::new()),
                },
            };

        ProcessSnapshot {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id,
            status,
            step_cursor,
            completed_steps,
            failed_steps,
            remaining_steps,
            variables,
            loop_active,
            restarts: self.restarts,
        }
    }
}

#[async_trait]
impl EventSink for ProcessContext {
    async fn publish(&self, event: ExecutionEvent) {
        if !self.emit_step(event).await {
            tracing::debug!("Dropped step event for cancelled execution {}", self.execution_id);
        }
    }
}

/// How a worker incarnation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// Finished and idle long enough, or its inbox was closed
    Finished,
    /// The step loop panicked
    Crashed { was_executing: bool },
}

/// One worker incarnation: answers commands and owns the step loop task
pub(crate) struct ExecutionProcess {
    ctx: Arc<ProcessContext>,
    step_loop: Option<JoinHandle<ProcessStatus>>,
}

impl ExecutionProcess {
    /// Load or restore an execution and bring it to `running` (or `paused`)
    pub(crate) async fn init(
        deps: &ProcessDeps,
        execution_id: ExecutionId,
        restarts: u32,
        auto_execute: bool,
    ) -> Result<Self, FlowError> {
        let record = deps.store.get(execution_id).await?;
        if record.status.is_terminal() {
            return Err(CommandError::AlreadyFinished(execution_id).into());
        }

        let steps = deps.workflows.ordered_steps(record.workflow_id).await?;

        let (state, restored) = match RuntimeState::restore(execution_id, deps.store.as_ref()).await {
            Ok(state) => (state, true),
            Err(StoreError::SnapshotNotFound(_)) => {
                (RuntimeState::new(execution_id, record.input_data.clone()), false)
            }
            Err(e) => return Err(e.into()),
        };

        let queue: VecDeque<StepSpec> = steps
            .into_iter()
            .filter(|step| !state.is_completed(&step.id))
            .collect();

        let paused = record.status == ExecutionStatus::Paused;
        let (status, directive) = if paused {
            (ProcessStatus::Paused, Directive::Pause)
        } else {
            (ProcessStatus::Running, Directive::Run)
        };
        let (directive, _) = watch::channel(directive);

        tracing::info!(
            "Worker for {} up: {} steps queued, restored={}, restarts={}",
            execution_id,
            queue.len(),
            restored,
            restarts
        );

        let ctx = Arc::new(ProcessContext {
            execution_id,
            workflow_id: record.workflow_id,
            deps: deps.clone(),
            restarts,
            runtime: Mutex::new(Some(state)),
            queue: Mutex::new(queue),
            status: RwLock::new(status),
            directive,
            retired: Mutex::new(None),
            emit_lock: Mutex::new(()),
        });

        if !paused {
            // A record still marked running is being re-entered after an interruption
            let recovered = record.status == ExecutionStatus::Running;
            deps.store.transition(execution_id, Transition::Start).await?;
            ctx.emit(ExecutionEvent::execution_started(
                execution_id,
                record.workflow_id,
                recovered,
            ))
            .await;
        }

        let mut process = Self {
            ctx,
            step_loop: None,
        };
        if auto_execute && !paused {
            process.spawn_loop();
        }
        Ok(process)
    }

    /// Serve commands until the execution is finished and idle, or the loop crashes
    pub(crate) async fn run(mut self, commands: &mut mpsc::Receiver<Command>) -> WorkerExit {
        let execution_id = self.ctx.execution_id;
        let idle_timeout = self.ctx.deps.config.idle_timeout;

        loop {
            let finished = self.step_loop.is_none() && self.ctx.status.read().await.is_terminal();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => return WorkerExit::Finished,
                },
                joined = join_loop(&mut self.step_loop) => {
                    self.step_loop = None;
                    match joined {
                        Ok(status) => tracing::debug!("Step loop for {} ended ({})", execution_id, status),
                        Err(e) if e.is_panic() => {
                            tracing::error!("Step loop for {} panicked", execution_id);
                            return WorkerExit::Crashed { was_executing: true };
                        }
                        Err(_) => tracing::warn!("Step loop for {} was aborted", execution_id),
                    }
                },
                _ = tokio::time::sleep(idle_timeout), if finished => {
                    tracing::debug!("Worker for {} idle after finishing, exiting", execution_id);
                    return WorkerExit::Finished;
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        let name = command.name();
        match command {
            Command::Execute(reply) => {
                let result = self.execute().await;
                self.respond(name, reply, result);
            }
            Command::Pause(reply) => {
                let result = self.pause().await;
                self.respond(name, reply, result);
            }
            Command::Resume(reply) => {
                let result = self.resume().await;
                self.respond(name, reply, result);
            }
            Command::Stop(reply) => {
                let result = self.stop().await;
                self.respond(name, reply, result);
            }
            Command::GetState(reply) => {
                let snapshot = self.ctx.describe(self.loop_alive()).await;
                let _ = reply.send(Ok(snapshot));
            }
        }
    }

    fn respond<T>(&self, name: &str, reply: Reply<T>, result: Result<T, FlowError>) {
        if let Err(e) = &result {
            tracing::warn!("Rejected {} for {}: {}", name, self.ctx.execution_id, e);
        }
        let _ = reply.send(result);
    }

    fn loop_alive(&self) -> bool {
        self.step_loop.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn spawn_loop(&mut self) {
        tracing::info!("Launching step loop for {}", self.ctx.execution_id);
        self.step_loop = Some(tokio::spawn(step_loop::run(self.ctx.clone())));
    }

    fn finished_error(&self, command: &'static str, status: ProcessStatus) -> FlowError {
        if status.is_terminal() {
            CommandError::AlreadyFinished(self.ctx.execution_id).into()
        } else {
            CommandError::InvalidState {
                command,
                status: status.to_string(),
            }
            .into()
        }
    }

    async fn execute(&mut self) -> Result<(), FlowError> {
        let status = *self.ctx.status.read().await;
        if status != ProcessStatus::Running {
            return Err(self.finished_error("execute", status));
        }
        if self.loop_alive() {
            tracing::debug!("Execution {} already has a step loop", self.ctx.execution_id);
        } else {
            self.spawn_loop();
        }
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), FlowError> {
        let execution_id = self.ctx.execution_id;
        let status = *self.ctx.status.read().await;
        if status.is_terminal() {
            return Err(self.finished_error("pause", status));
        }

        // Raised only from Run, so a loop that already committed to finishing wins
        let raised = self.ctx.directive.send_if_modified(|directive| {
            if *directive == Directive::Run {
                *directive = Directive::Pause;
                true
            } else {
                false
            }
        });
        if !raised {
            let status = if *self.ctx.directive.borrow() == Directive::Finishing {
                "finishing".to_string()
            } else {
                status.to_string()
            };
            return Err(CommandError::InvalidState { command: "pause", status }.into());
        }

        if let Err(e) = self.ctx.deps.store.transition(execution_id, Transition::Pause).await {
            self.ctx.directive.send_if_modified(|directive| {
                if *directive == Directive::Pause {
                    *directive = Directive::Run;
                    true
                } else {
                    false
                }
            });
            return Err(e.into());
        }

        let cursor = self.ctx.step_cursor().await;
        self.ctx
            .emit(ExecutionEvent::execution_paused(execution_id, cursor.as_deref()))
            .await;
        self.ctx.set_status(ProcessStatus::Paused).await;
        tracing::info!("Execution {} paused", execution_id);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), FlowError> {
        let execution_id = self.ctx.execution_id;
        let status = *self.ctx.status.read().await;
        if status != ProcessStatus::Paused {
            return Err(self.finished_error("resume", status));
        }

        self.ctx.deps.store.transition(execution_id, Transition::Resume).await?;
        self.ctx.emit(ExecutionEvent::execution_resumed(execution_id)).await;
        self.ctx.set_status(ProcessStatus::Running).await;
        self.ctx.directive.send_if_modified(|directive| {
            if *directive == Directive::Pause {
                *directive = Directive::Run;
                true
            } else {
                false
            }
        });

        // A worker that came up paused has no loop yet
        if !self.loop_alive() {
            self.spawn_loop();
        }
        tracing::info!("Execution {} resumed", execution_id);
        Ok(())
    }

    /// Cancel the execution durably before acknowledging.
    ///
    /// The record is moved to `cancelled` and `execution_cancelled` is
    /// published here; the loop only has to notice and release its state.
    async fn stop(&mut self) -> Result<(), FlowError> {
        let execution_id = self.ctx.execution_id;
        let status = *self.ctx.status.read().await;
        if status.is_terminal() {
            return Err(self.finished_error("stop", status));
        }
        if status == ProcessStatus::Cancelling {
            return Ok(());
        }

        let mut previous = Directive::Run;
        let raised = self.ctx.directive.send_if_modified(|directive| match *directive {
            Directive::Run | Directive::Pause => {
                previous = *directive;
                *directive = Directive::Cancel;
                true
            }
            Directive::Cancel | Directive::Cancelled | Directive::Finishing => false,
        });
        if !raised {
            return Err(CommandError::InvalidState {
                command: "stop",
                status: "finishing".to_string(),
            }
            .into());
        }
        self.ctx.set_status(ProcessStatus::Cancelling).await;

        // Terminal records reject snapshots, so the last one goes first
        self.ctx.save_snapshot().await;
        let record = match self.ctx.deps.store.transition(execution_id, Transition::Cancel).await {
            Ok(record) => record,
            Err(e) => {
                self.ctx.set_status(status).await;
                self.ctx.directive.send_if_modified(|directive| {
                    if *directive == Directive::Cancel {
                        *directive = previous;
                        true
                    } else {
                        false
                    }
                });
                return Err(e.into());
            }
        };

        let duration_ms = record
            .started_at
            .zip(record.completed_at)
            .map(|(start, end)| (end - start).num_milliseconds().max(0) as u64);
        let cursor = self.ctx.step_cursor().await;
        self.ctx
            .record_cancel(ExecutionEvent::execution_cancelled(execution_id, cursor.as_deref(), duration_ms))
            .await;

        // With no loop to observe the flag, one is launched just to release the state
        if !self.loop_alive() {
            self.spawn_loop();
        }
        tracing::info!("Execution {} cancelled", execution_id);
        Ok(())
    }
}

impl Drop for ExecutionProcess {
    fn drop(&mut self) {
        if let Some(handle) = self.step_loop.take() {
            handle.abort();
        }
    }
}

async fn join_loop(step_loop: &mut Option<JoinHandle<ProcessStatus>>) -> Result<ProcessStatus, JoinError> {
    match step_loop {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
