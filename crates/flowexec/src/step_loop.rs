//! The detached task that drives an execution through its step queue

use crate::process::{Directive, ProcessContext, ProcessStatus};
use flowcore::{
    EventSink, ExecutionEvent, StepContext, StepEmitter, StepId, StepSpec, Transition, Variables,
};
use std::sync::Arc;
use std::time::Instant;

enum Checkpoint {
    Next,
    Park,
    Hold,
    Complete,
    Cancel,
    Halt,
}

enum Outcome {
    Completed,
    Failed { message: String, step_id: StepId },
}

/// Why a step did not hand control back to the loop
enum Interrupt {
    Failed { message: String, step_id: StepId },
    Cancelled,
}

/// Run queued steps until the execution finishes, parking while paused
pub(crate) async fn run(ctx: Arc<ProcessContext>) -> ProcessStatus {
    let execution_id = ctx.execution_id;
    let policy = ctx.deps.config.snapshot_policy;
    let mut since_snapshot = 0u32;

    loop {
        match checkpoint(&ctx).await {
            Checkpoint::Complete => return finalize(&ctx, Outcome::Completed).await,
            Checkpoint::Cancel => return retire(&ctx, ProcessStatus::Cancelled).await,
            Checkpoint::Halt => return *ctx.status.read().await,
            Checkpoint::Hold => {
                if !settle_cancel(&ctx).await {
                    return *ctx.status.read().await;
                }
            }
            Checkpoint::Park => {
                ctx.save_snapshot().await;
                since_snapshot = 0;
                tracing::debug!("Step loop for {} parked", execution_id);

                let mut directive = ctx.directive.subscribe();
                if directive.wait_for(|d| *d != Directive::Pause).await.is_err() {
                    return *ctx.status.read().await;
                }
                tracing::debug!("Step loop for {} unparked", execution_id);
            }
            Checkpoint::Next => {
                let Some(step) = ctx.queue.lock().await.pop_front() else {
                    continue;
                };

                if !step.enabled {
                    tracing::debug!("Skipping disabled step {} of {}", step.id, execution_id);
                    ctx.emit_step(ExecutionEvent::step_skipped(execution_id, &step, "disabled"))
                        .await;
                    continue;
                }

                match run_step(&ctx, &step).await {
                    Ok(()) => {}
                    Err(Interrupt::Failed { message, step_id }) => {
                        return finalize(&ctx, Outcome::Failed { message, step_id }).await;
                    }
                    Err(Interrupt::Cancelled) => return retire(&ctx, ProcessStatus::Cancelled).await,
                }

                since_snapshot += 1;
                if policy.is_due(since_snapshot) && !ctx.directive.borrow().is_cancel() {
                    ctx.save_snapshot().await;
                    since_snapshot = 0;
                }
            }
        }
    }
}

/// Decide the next move from the directive.
///
/// Finishing is committed atomically with the check, so a pause or stop
/// arriving later is rejected instead of racing the finalize.
async fn checkpoint(ctx: &ProcessContext) -> Checkpoint {
    let queue_empty = ctx.queue.lock().await.is_empty();
    let mut decision = Checkpoint::Halt;

    ctx.directive.send_if_modified(|directive| match *directive {
        Directive::Run if queue_empty => {
            *directive = Directive::Finishing;
            decision = Checkpoint::Complete;
            true
        }
        Directive::Run => {
            decision = Checkpoint::Next;
            false
        }
        Directive::Pause => {
            decision = Checkpoint::Park;
            false
        }
        Directive::Cancel => {
            decision = Checkpoint::Hold;
            false
        }
        Directive::Cancelled => {
            decision = Checkpoint::Cancel;
            false
        }
        Directive::Finishing => false,
    });

    decision
}

/// Wait until a stop in flight is either recorded or rolled back
async fn settle_cancel(ctx: &ProcessContext) -> bool {
    let mut directive = ctx.directive.subscribe();
    let settled = directive.wait_for(|d| *d != Directive::Cancel).await.is_ok();
    settled
}

/// Commit to finishing as failed; false when a recorded cancel got there first
async fn commit_failure(ctx: &ProcessContext) -> bool {
    loop {
        let mut committed = None;
        ctx.directive.send_if_modified(|directive| match *directive {
            Directive::Run | Directive::Pause => {
                *directive = Directive::Finishing;
                committed = Some(true);
                true
            }
            Directive::Finishing => {
                committed = Some(true);
                false
            }
            Directive::Cancelled => {
                committed = Some(false);
                false
            }
            Directive::Cancel => false,
        });

        match committed {
            Some(committed) => return committed,
            None if settle_cancel(ctx).await => continue,
            None => return true,
        }
    }
}

async fn run_step(ctx: &Arc<ProcessContext>, step: &StepSpec) -> Result<(), Interrupt> {
    let execution_id = ctx.execution_id;

    let variables = {
        let mut runtime = ctx.runtime.lock().await;
        let Some(state) = runtime.as_mut() else {
            return Err(Interrupt::Failed {
                message: "runtime state already released".to_string(),
                step_id: step.id.clone(),
            });
        };
        state.set_step_cursor(step.id.clone());
        state.get_variables().clone()
    };

    if !ctx.emit_step(ExecutionEvent::step_started(execution_id, step)).await {
        return Err(Interrupt::Cancelled);
    }
    tracing::debug!("Running step {} ({}) of {}", step.id, step.step_type, execution_id);

    let sink: Arc<dyn EventSink> = ctx.clone();
    let step_ctx = StepContext {
        execution_id,
        step_id: step.id.clone(),
        config: step.config.clone(),
        variables,
        events: StepEmitter::new(execution_id, step.id.clone(), sink),
    };

    let started = Instant::now();
    let result = ctx.deps.executor.execute(step, step_ctx).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(output) => {
            let output = output.into_value();
            if let Some(state) = ctx.runtime.lock().await.as_mut() {
                state.store_step_output(&step.id, output.clone());
                state.mark_step_completed(&step.id);
            }
            let event = ExecutionEvent::step_completed(execution_id, step, &output, duration_ms);
            if !ctx.emit_step(event).await {
                tracing::debug!("Discarding result of step {}, {} was cancelled", step.id, execution_id);
                return Err(Interrupt::Cancelled);
            }
            tracing::info!("Step {} of {} completed in {}ms", step.id, execution_id, duration_ms);
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            if !commit_failure(ctx).await {
                tracing::info!("Step {} of {} failed after cancel: {}", step.id, execution_id, message);
                return Err(Interrupt::Cancelled);
            }
            if let Some(state) = ctx.runtime.lock().await.as_mut() {
                state.mark_step_failed(&step.id);
            }
            ctx.emit(ExecutionEvent::step_failed(execution_id, step, &message, duration_ms))
                .await;
            tracing::error!("Step {} of {} failed: {}", step.id, execution_id, message);
            Err(Interrupt::Failed {
                message,
                step_id: step.id.clone(),
            })
        }
    }
}

async fn finalize(ctx: &ProcessContext, outcome: Outcome) -> ProcessStatus {
    let execution_id = ctx.execution_id;

    // Terminal records reject snapshots, so the final one is written first
    ctx.save_snapshot().await;

    let variables = match ctx.runtime.lock().await.as_ref() {
        Some(state) => state.get_variables().clone(),
        None => Variables::new(),
    };

    let (transition, status) = match &outcome {
        Outcome::Completed => (
            Transition::Complete {
                output: variables.clone(),
            },
            ProcessStatus::Completed,
        ),
        Outcome::Failed { message, step_id } => (
            Transition::Fail {
                message: message.clone(),
                step_id: Some(step_id.clone()),
            },
            ProcessStatus::Failed,
        ),
    };

    let duration_ms = match ctx.deps.store.transition(execution_id, transition).await {
        Ok(record) => record
            .started_at
            .zip(record.completed_at)
            .map(|(start, end)| (end - start).num_milliseconds().max(0) as u64),
        Err(e) => {
            tracing::error!("Failed to persist {} for {}: {}", status, execution_id, e);
            None
        }
    };

    ctx.set_status(status).await;

    let event = match &outcome {
        Outcome::Completed => ExecutionEvent::execution_completed(execution_id, &variables, duration_ms),
        Outcome::Failed { message, step_id } => {
            ExecutionEvent::execution_failed(execution_id, message, Some(step_id.as_str()), duration_ms)
        }
    };
    ctx.emit(event).await;

    retire(ctx, status).await
}

/// Drop the runtime state and close the execution's stream.
///
/// A cancelled execution comes straight here: its record and terminal
/// event were written when the stop was accepted.
async fn retire(ctx: &ProcessContext, status: ProcessStatus) -> ProcessStatus {
    ctx.set_status(status).await;
    ctx.release().await;
    ctx.deps.publisher.bus().close_topic(ctx.execution_id).await;
    tracing::info!("Execution {} {}", ctx.execution_id, status);
    status
}
