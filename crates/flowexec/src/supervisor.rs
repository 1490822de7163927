use crate::process::{Command, ExecutionProcess, ProcessDeps, ProcessHandle, WorkerExit};
use chrono::Utc;
use flowcore::{CommandError, ExecutionEvent, ExecutionId, FlowError, Transition};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;

struct Worker {
    handle: ProcessHandle,
    task: AbortHandle,
}

/// Registry of live workers plus their one-for-one restart policy
///
/// The registry lock is the only place two callers can race for the same
/// execution; whoever inserts first owns the worker.
pub struct Supervisor {
    deps: ProcessDeps,
    workers: Mutex<HashMap<ExecutionId, Worker>>,
}

impl Supervisor {
    pub fn new(deps: ProcessDeps) -> Self {
        Self {
            deps,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Start the worker for an execution, or return the live one
    ///
    /// A finished execution is refused the same way whether or not its
    /// worker is still idling.
    pub async fn start(self: &Arc<Self>, execution_id: ExecutionId) -> Result<ProcessHandle, FlowError> {
        let (handle, ready) = {
            let mut workers = self.workers.lock().await;
            if let Some(worker) = workers.get(&execution_id) {
                if worker.handle.is_alive() {
                    if self.deps.store.get(execution_id).await?.status.is_terminal() {
                        return Err(CommandError::AlreadyFinished(execution_id).into());
                    }
                    tracing::debug!("Reusing live worker for {}", execution_id);
                    return Ok(worker.handle.clone());
                }
            }

            let (sender, commands) = mpsc::channel(self.deps.config.command_buffer_size.max(1));
            let handle = ProcessHandle::new(execution_id, sender);
            let (ready_tx, ready) = oneshot::channel();
            let task = tokio::spawn(self.clone().supervise(handle.clone(), commands, ready_tx));
            workers.insert(
                execution_id,
                Worker {
                    handle: handle.clone(),
                    task: task.abort_handle(),
                },
            );
            (handle, ready)
        };

        match ready.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                self.deregister(&handle).await;
                Err(e)
            }
            Err(_) => {
                self.deregister(&handle).await;
                Err(CommandError::WorkerUnavailable(execution_id).into())
            }
        }
    }

    /// Handle of the live worker for an execution
    pub async fn lookup(&self, execution_id: ExecutionId) -> Option<ProcessHandle> {
        self.workers
            .lock()
            .await
            .get(&execution_id)
            .map(|worker| worker.handle.clone())
            .filter(ProcessHandle::is_alive)
    }

    pub async fn live_count(&self) -> usize {
        self.workers
            .lock()
            .await
            .values()
            .filter(|worker| worker.handle.is_alive())
            .count()
    }

    /// Abort every worker without touching the records, as a process exit would
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for (execution_id, worker) in workers.drain() {
            tracing::info!("Stopping worker for {}", execution_id);
            worker.task.abort();
        }
    }

    async fn supervise(
        self: Arc<Self>,
        handle: ProcessHandle,
        mut commands: mpsc::Receiver<Command>,
        ready: oneshot::Sender<Result<(), FlowError>>,
    ) {
        let execution_id = handle.execution_id();
        let mut ready = Some(ready);
        let mut restarts = 0u32;
        let mut auto_execute = false;

        loop {
            let incarnation =
                self.incarnation(execution_id, &mut commands, restarts, auto_execute, &mut ready);
            let was_executing = match AssertUnwindSafe(incarnation).catch_unwind().await {
                Ok(WorkerExit::Finished) => break,
                Ok(WorkerExit::Crashed { was_executing }) => was_executing,
                Err(panic) => {
                    tracing::error!("Worker for {} panicked: {}", execution_id, panic_message(&*panic));
                    true
                }
            };

            restarts += 1;
            if restarts > self.deps.config.max_restarts {
                self.give_up(execution_id, restarts).await;
                break;
            }
            tracing::warn!(
                "Restarting worker for {} ({}/{})",
                execution_id,
                restarts,
                self.deps.config.max_restarts
            );
            auto_execute = was_executing;
        }

        commands.close();
        self.deregister(&handle).await;
        tracing::debug!("Worker for {} deregistered", execution_id);
    }

    async fn incarnation(
        &self,
        execution_id: ExecutionId,
        commands: &mut mpsc::Receiver<Command>,
        restarts: u32,
        auto_execute: bool,
        ready: &mut Option<oneshot::Sender<Result<(), FlowError>>>,
    ) -> WorkerExit {
        match ExecutionProcess::init(&self.deps, execution_id, restarts, auto_execute).await {
            Ok(process) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                process.run(commands).await
            }
            Err(e) => {
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(e));
                    }
                    None => {
                        // A stop persisted before the crash leaves nothing to resume
                        match e {
                            FlowError::Command(CommandError::AlreadyFinished(_)) => {
                                tracing::info!("Execution {} finished before the restart", execution_id)
                            }
                            e => tracing::error!("Worker for {} could not restart: {}", execution_id, e),
                        }
                        self.deps.publisher.bus().close_topic(execution_id).await;
                    }
                }
                WorkerExit::Finished
            }
        }
    }

    async fn give_up(&self, execution_id: ExecutionId, crashes: u32) {
        let message = format!("worker crashed {} times", crashes);
        tracing::error!("Giving up on {}: {}", execution_id, message);

        let transition = Transition::Fail {
            message: message.clone(),
            step_id: None,
        };
        match self.deps.store.transition(execution_id, transition).await {
            Ok(record) => {
                let duration_ms = record
                    .started_at
                    .map(|start| (Utc::now() - start).num_milliseconds().max(0) as u64);
                self.deps
                    .publisher
                    .publish(ExecutionEvent::execution_failed(execution_id, &message, None, duration_ms))
                    .await;
            }
            Err(e) => tracing::error!("Failed to mark {} failed: {}", execution_id, e),
        }
        self.deps.publisher.bus().close_topic(execution_id).await;
    }

    async fn deregister(&self, handle: &ProcessHandle) {
        let mut workers = self.workers.lock().await;
        let current = workers
            .get(&handle.execution_id())
            .is_some_and(|worker| worker.handle == *handle);
        if current {
            workers.remove(&handle.execution_id());
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
