use async_trait::async_trait;
use flowcore::{
    CommandError, EventQuery, EventType, ExecutionEvent, ExecutionId, ExecutionStatus,
    ExecutionStore, FlowError, MemoryStore, StepContext, StepError, StepExecutor, StepOutput,
    StepSpec, Variables, WorkflowDefinition, WorkflowId,
};
use flowexec::{EngineConfig, FlowEngine, ProcessStatus, SnapshotPolicy};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("flowexec=debug")
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

/// Step executor whose behavior is scripted per step id
#[derive(Default)]
struct Script {
    gates: HashMap<String, Arc<Gate>>,
    failures: HashMap<String, String>,
    timeouts: HashMap<String, u64>,
    panic_once: Mutex<HashSet<String>>,
    always_panic: HashSet<String>,
}

impl Script {
    fn gate(mut self, step_id: &str) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        self.gates.insert(step_id.to_string(), gate.clone());
        (self, gate)
    }

    fn fail(mut self, step_id: &str, reason: &str) -> Self {
        self.failures.insert(step_id.to_string(), reason.to_string());
        self
    }

    fn time_out(mut self, step_id: &str, ms: u64) -> Self {
        self.timeouts.insert(step_id.to_string(), ms);
        self
    }

    fn panic_once(self, step_id: &str) -> Self {
        self.panic_once.lock().unwrap().insert(step_id.to_string());
        self
    }

    fn always_panic(mut self, step_id: &str) -> Self {
        self.always_panic.insert(step_id.to_string());
        self
    }
}

#[async_trait]
impl StepExecutor for Script {
    async fn execute(&self, step: &StepSpec, ctx: StepContext) -> Result<StepOutput, StepError> {
        if let Some(gate) = self.gates.get(&step.id) {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.always_panic.contains(&step.id) {
            panic!("step {} exploded", step.id);
        }
        let explode_once = self.panic_once.lock().unwrap().remove(&step.id);
        if explode_once {
            panic!("step {} exploded once", step.id);
        }
        if let Some(reason) = self.failures.get(&step.id) {
            return Err(StepError::ExecutionFailed(reason.clone()));
        }
        if let Some(ms) = self.timeouts.get(&step.id) {
            return Err(StepError::Timeout { ms: *ms });
        }

        Ok(StepOutput::new()
            .with_output("step", step.id.clone())
            .with_output("seen", ctx.variables.len()))
    }
}

fn workflow(ids: &[&str]) -> WorkflowDefinition {
    ids.iter().fold(WorkflowDefinition::new("scripted"), |wf, id| {
        wf.with_step(StepSpec::new(*id, "test.script"))
    })
}

struct Harness {
    engine: FlowEngine,
    store: Arc<MemoryStore>,
    workflow_id: WorkflowId,
}

async fn harness(script: Script, definition: WorkflowDefinition, config: EngineConfig) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = FlowEngine::builder()
        .config(config)
        .storage(store.clone())
        .executor(Arc::new(script))
        .build();
    let workflow_id = engine.register_workflow(definition).await.unwrap();
    Harness {
        engine,
        store,
        workflow_id,
    }
}

impl Harness {
    async fn create(&self) -> ExecutionId {
        let mut input = Variables::new();
        input.insert("site".to_string(), json!("example.org"));
        self.engine
            .create_execution(self.workflow_id, "acct-1", input)
            .await
            .unwrap()
            .id
    }

    async fn log(&self, id: ExecutionId) -> Vec<ExecutionEvent> {
        self.engine
            .events(&EventQuery::for_execution(id))
            .await
            .unwrap()
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<flowcore::ProgressEvent>,
    event_type: EventType,
    step: Option<&str>,
) {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if event.event_type == event_type && (step.is_none() || event.step_id.as_deref() == step) {
                return;
            }
        }
    })
    .await
    .unwrap();
}

async fn wait_terminal(engine: &FlowEngine, id: ExecutionId) -> flowcore::Execution {
    timeout(WAIT, async {
        loop {
            let record = engine.get_execution(id).await.unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

/// Wait until the live worker reports `status`
async fn wait_status(engine: &FlowEngine, id: ExecutionId, status: ProcessStatus) {
    timeout(WAIT, async {
        while engine.get_state(id).await.unwrap().status != status {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn count(log: &[ExecutionEvent], event_type: EventType, step: &str) -> usize {
    log.iter()
        .filter(|e| e.event_type == event_type && e.step_id.as_deref() == Some(step))
        .count()
}

#[tokio::test]
async fn test_runs_steps_in_order_to_completion() {
    let h = harness(Script::default(), workflow(&["A", "B", "C"]), EngineConfig::default()).await;
    let id = h.create().await;

    let record = timeout(WAIT, h.engine.run_to_completion(id)).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.completed_step_ids, vec!["A", "B", "C"]);

    let log = h.log(id).await;
    let types: Vec<_> = log.iter().map(|e| e.event_type).collect();
    assert_eq!(types.first(), Some(&EventType::ExecutionStarted));
    assert_eq!(types.last(), Some(&EventType::ExecutionCompleted));
    let started: Vec<_> = log
        .iter()
        .filter(|e| e.event_type == EventType::StepStarted)
        .filter_map(|e| e.step_id.as_deref())
        .collect();
    assert_eq!(started, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_output_data_equals_final_variables() {
    let h = harness(Script::default(), workflow(&["A", "B"]), EngineConfig::default()).await;
    let id = h.create().await;

    let record = timeout(WAIT, h.engine.run_to_completion(id)).await.unwrap().unwrap();
    let output = record.output_data.clone().unwrap();
    assert_eq!(output["site"], json!("example.org"));
    assert_eq!(output["A"], json!({"step": "A", "seen": 1}));
    assert_eq!(output["B"], json!({"step": "B", "seen": 2}));
    assert_eq!(Some(output), record.context_snapshot.map(|s| s.variables));

    let log = h.log(id).await;
    let completed = log.last().unwrap();
    assert_eq!(completed.event_type, EventType::ExecutionCompleted);
    assert_eq!(completed.payload["output"]["B"]["step"], json!("B"));
    assert!(completed.duration_ms.is_some());
}

#[tokio::test]
async fn test_pause_and_resume_runs_each_step_once() {
    let (script, gate) = Script::default().gate("A");
    let h = harness(script, workflow(&["A", "B", "C"]), EngineConfig::default()).await;
    let id = h.create().await;
    let mut events = h.engine.subscribe_execution(id).await;

    h.engine.start_execution(id).await.unwrap();
    h.engine.execute(id).await.unwrap();
    timeout(WAIT, gate.entered.notified()).await.unwrap();

    h.engine.pause(id).await.unwrap();
    assert_eq!(
        h.store.get(id).await.unwrap().status,
        ExecutionStatus::Paused,
        "pause is persisted before the step finishes"
    );
    gate.release.notify_one();
    wait_for(&mut events, EventType::StepCompleted, Some("A")).await;

    let state = h.engine.get_state(id).await.unwrap();
    assert_eq!(state.status, ProcessStatus::Paused);
    assert_eq!(state.completed_steps, vec!["A"]);

    h.engine.resume(id).await.unwrap();
    let record = wait_terminal(&h.engine, id).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.completed_step_ids, vec!["A", "B", "C"]);

    let log = h.log(id).await;
    for step in ["A", "B", "C"] {
        assert_eq!(count(&log, EventType::StepStarted, step), 1, "step {}", step);
    }
    let lifecycle: Vec<_> = log
        .iter()
        .map(|e| e.event_type)
        .filter(|t| matches!(t, EventType::ExecutionPaused | EventType::ExecutionResumed))
        .collect();
    assert_eq!(lifecycle, vec![EventType::ExecutionPaused, EventType::ExecutionResumed]);
}

#[tokio::test]
async fn test_pause_keeps_variables() {
    let (script, gate) = Script::default().gate("A");
    let h = harness(script, workflow(&["A", "B"]), EngineConfig::default()).await;
    let id = h.create().await;

    h.engine.start_execution(id).await.unwrap();
    h.engine.execute(id).await.unwrap();
    timeout(WAIT, gate.entered.notified()).await.unwrap();
    h.engine.pause(id).await.unwrap();
    gate.release.notify_one();

    // Parked once A's result is in the record
    let snapshot = timeout(WAIT, async {
        loop {
            let record = h.store.get(id).await.unwrap();
            if let Some(snapshot) = record.context_snapshot.filter(|s| s.completed_steps == ["A"]) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let state = h.engine.get_state(id).await.unwrap();
    assert_eq!(state.status, ProcessStatus::Paused);
    assert_eq!(state.variables, snapshot.variables);
    assert_eq!(state.variables["site"], json!("example.org"));
    assert_eq!(state.variables["A"], json!({"step": "A", "seen": 1}));

    h.engine.resume(id).await.unwrap();
    let record = wait_terminal(&h.engine, id).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    let output = record.output_data.unwrap();
    assert_eq!(output["site"], json!("example.org"));
    assert_eq!(output["A"], json!({"step": "A", "seen": 1}));
    assert_eq!(output["B"], json!({"step": "B", "seen": 2}));
}

#[tokio::test]
async fn test_step_timeout_fails_execution() {
    let script = Script::default().time_out("B", 250);
    let h = harness(script, workflow(&["A", "B", "C"]), EngineConfig::default()).await;
    let id = h.create().await;

    let record = timeout(WAIT, h.engine.run_to_completion(id)).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_step_id.as_deref(), Some("B"));
    assert_eq!(record.error_message.as_deref(), Some("Timeout after 250ms"));
    assert_eq!(record.completed_step_ids, vec!["A"]);

    let log = h.log(id).await;
    assert_eq!(count(&log, EventType::StepStarted, "C"), 0);
    let failed = log.last().unwrap();
    assert_eq!(failed.event_type, EventType::ExecutionFailed);
    assert_eq!(failed.payload["error_message"], json!("Timeout after 250ms"));
}

#[tokio::test]
async fn test_step_failure_fails_execution() {
    let script = Script::default().fail("B", "timeout");
    let h = harness(script, workflow(&["A", "B", "C"]), EngineConfig::default()).await;
    let id = h.create().await;

    let record = timeout(WAIT, h.engine.run_to_completion(id)).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_step_id.as_deref(), Some("B"));
    assert_eq!(record.error_message.as_deref(), Some("timeout"));
    assert_eq!(record.failed_step_ids, vec!["B"]);
    assert!(record.output_data.is_none());

    let log = h.log(id).await;
    assert_eq!(count(&log, EventType::StepFailed, "B"), 1);
    assert_eq!(count(&log, EventType::StepStarted, "C"), 0);
    assert_eq!(log.last().unwrap().event_type, EventType::ExecutionFailed);
}

#[tokio::test]
async fn test_cancel_mid_run() {
    let (script, gate) = Script::default().gate("B");
    let h = harness(script, workflow(&["A", "B", "C"]), EngineConfig::default()).await;
    let id = h.create().await;

    h.engine.start_execution(id).await.unwrap();
    h.engine.execute(id).await.unwrap();
    timeout(WAIT, gate.entered.notified()).await.unwrap();

    h.engine.stop(id).await.unwrap();
    assert_eq!(
        h.store.get(id).await.unwrap().status,
        ExecutionStatus::Cancelled,
        "cancel is persisted before stop returns"
    );
    assert_eq!(
        h.engine.get_state(id).await.unwrap().status,
        ProcessStatus::Cancelling
    );
    assert!(matches!(
        h.engine.pause(id).await,
        Err(FlowError::Command(CommandError::InvalidState { command: "pause", .. }))
    ));
    gate.release.notify_one();
    wait_status(&h.engine, id, ProcessStatus::Cancelled).await;

    let log = h.log(id).await;
    assert_eq!(count(&log, EventType::StepCompleted, "A"), 1);
    // B's late result is dropped rather than logged after the cancel
    assert_eq!(count(&log, EventType::StepCompleted, "B"), 0);
    assert_eq!(count(&log, EventType::StepStarted, "C"), 0);
    let cancelled = log.last().unwrap();
    assert_eq!(cancelled.event_type, EventType::ExecutionCancelled);
    assert_eq!(cancelled.payload["step_cursor"], json!("B"));
    assert_eq!(
        log.iter()
            .filter(|e| e.event_type == EventType::ExecutionCancelled)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_cancel_survives_worker_crash() {
    let (script, gate) = Script::default().gate("B");
    let script = script.panic_once("B");
    let h = harness(script, workflow(&["A", "B", "C"]), EngineConfig::default()).await;
    let id = h.create().await;
    let mut events = h.engine.subscribe_execution(id).await;

    h.engine.start_execution(id).await.unwrap();
    h.engine.execute(id).await.unwrap();
    timeout(WAIT, gate.entered.notified()).await.unwrap();

    h.engine.stop(id).await.unwrap();
    assert_eq!(h.store.get(id).await.unwrap().status, ExecutionStatus::Cancelled);

    // B blows up after the stop was acknowledged; the restart must not resume
    gate.release.notify_one();
    let mut received = Vec::new();
    timeout(WAIT, async {
        while let Ok(event) = events.recv().await {
            received.push(event.event_type);
        }
    })
    .await
    .unwrap();
    assert_eq!(received.last(), Some(&EventType::ExecutionCancelled));

    timeout(WAIT, async {
        while h.engine.live_workers().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let record = h.store.get(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert!(record.completed_at.is_some());

    let log = h.log(id).await;
    assert_eq!(count(&log, EventType::StepStarted, "B"), 1);
    assert_eq!(count(&log, EventType::StepStarted, "C"), 0);
    assert_eq!(
        log.iter()
            .filter(|e| e.event_type == EventType::ExecutionStarted)
            .count(),
        1
    );
    assert_eq!(log.last().unwrap().event_type, EventType::ExecutionCancelled);
}

#[tokio::test]
async fn test_stop_while_parked() {
    let (script, gate) = Script::default().gate("A");
    let h = harness(script, workflow(&["A", "B"]), EngineConfig::default()).await;
    let id = h.create().await;
    let mut events = h.engine.subscribe_execution(id).await;

    h.engine.start_execution(id).await.unwrap();
    h.engine.execute(id).await.unwrap();
    timeout(WAIT, gate.entered.notified()).await.unwrap();
    h.engine.pause(id).await.unwrap();
    gate.release.notify_one();
    wait_for(&mut events, EventType::StepCompleted, Some("A")).await;

    let state = h.engine.get_state(id).await.unwrap();
    assert_eq!(state.status, ProcessStatus::Paused);
    assert!(state.loop_active);

    h.engine.stop(id).await.unwrap();
    assert_eq!(h.store.get(id).await.unwrap().status, ExecutionStatus::Cancelled);
    wait_status(&h.engine, id, ProcessStatus::Cancelled).await;

    let log = h.log(id).await;
    assert_eq!(count(&log, EventType::StepStarted, "B"), 0);
    assert_eq!(log.last().unwrap().event_type, EventType::ExecutionCancelled);
    assert!(matches!(
        h.engine.resume(id).await,
        Err(FlowError::Command(CommandError::AlreadyFinished(_)))
    ));
}

#[tokio::test]
async fn test_stop_without_loop_finalizes() {
    let h = harness(Script::default(), workflow(&["A"]), EngineConfig::default()).await;
    let id = h.create().await;

    h.engine.start_execution(id).await.unwrap();
    h.engine.stop(id).await.unwrap();

    let record = wait_terminal(&h.engine, id).await;
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(count(&h.log(id).await, EventType::StepStarted, "A"), 0);
}

#[tokio::test]
async fn test_crash_restores_from_snapshot() {
    let script = Script::default().panic_once("B");
    let h = harness(script, workflow(&["A", "B", "C"]), EngineConfig::default()).await;
    let id = h.create().await;

    let record = timeout(WAIT, h.engine.run_to_completion(id)).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.completed_step_ids, vec!["A", "B", "C"]);

    let log = h.log(id).await;
    assert_eq!(count(&log, EventType::StepStarted, "A"), 1);
    assert_eq!(count(&log, EventType::StepStarted, "B"), 2);
    assert_eq!(count(&log, EventType::StepStarted, "C"), 1);

    let starts: Vec<_> = log
        .iter()
        .filter(|e| e.event_type == EventType::ExecutionStarted)
        .map(|e| e.payload["recovered"].clone())
        .collect();
    assert_eq!(starts, vec![json!(false), json!(true)]);
}

#[tokio::test]
async fn test_supervisor_gives_up_after_max_restarts() {
    let script = Script::default().always_panic("B");
    let config = EngineConfig {
        max_restarts: 1,
        ..EngineConfig::default()
    };
    let h = harness(script, workflow(&["A", "B"]), config).await;
    let id = h.create().await;

    let record = timeout(WAIT, h.engine.run_to_completion(id)).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("worker crashed 2 times"));

    let log = h.log(id).await;
    assert_eq!(count(&log, EventType::StepStarted, "B"), 2);
    assert_eq!(log.last().unwrap().event_type, EventType::ExecutionFailed);
}

#[tokio::test]
async fn test_subscriber_sees_log_order() {
    let h = harness(Script::default(), workflow(&["A", "B", "C"]), EngineConfig::default()).await;
    let id = h.create().await;
    let mut events = h.engine.subscribe_execution(id).await;

    h.engine.start_execution(id).await.unwrap();
    h.engine.execute(id).await.unwrap();

    let mut received = Vec::new();
    timeout(WAIT, async {
        while let Ok(event) = events.recv().await {
            received.push(event);
        }
    })
    .await
    .unwrap();

    received.sort_by_key(|e| e.timestamp);
    let broadcast_ids: Vec<_> = received.iter().map(|e| e.event_id).collect();
    let log_ids: Vec<_> = h.log(id).await.iter().map(|e| e.id).collect();
    assert_eq!(broadcast_ids, log_ids);
}

#[tokio::test]
async fn test_concurrent_start_returns_same_handle() {
    let h = harness(Script::default(), workflow(&["A"]), EngineConfig::default()).await;
    let id = h.create().await;

    let (first, second) = tokio::join!(h.engine.start_execution(id), h.engine.start_execution(id));
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first, second);
    assert_eq!(h.engine.start_execution(id).await.unwrap(), first);
    assert_eq!(h.engine.live_workers().await, 1);

    let log = h.log(id).await;
    assert_eq!(
        log.iter()
            .filter(|e| e.event_type == EventType::ExecutionStarted)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_invalid_commands_are_rejected() {
    let config = EngineConfig {
        idle_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let h = harness(Script::default(), workflow(&["A"]), config).await;
    let id = h.create().await;

    assert!(matches!(
        h.engine.execute(id).await,
        Err(FlowError::Command(CommandError::UnknownExecution(_)))
    ));

    h.engine.start_execution(id).await.unwrap();
    assert!(matches!(
        h.engine.resume(id).await,
        Err(FlowError::Command(CommandError::InvalidState { command: "resume", .. }))
    ));

    h.engine.pause(id).await.unwrap();
    assert!(matches!(
        h.engine.pause(id).await,
        Err(FlowError::Command(CommandError::InvalidState { command: "pause", .. }))
    ));
    assert!(matches!(
        h.engine.execute(id).await,
        Err(FlowError::Command(CommandError::InvalidState { command: "execute", .. }))
    ));

    h.engine.resume(id).await.unwrap();
    let record = wait_terminal(&h.engine, id).await;
    assert_eq!(record.status, ExecutionStatus::Completed);

    // The finished worker lingers for its idle timeout, then goes away
    timeout(WAIT, async {
        while h.engine.live_workers().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(matches!(
        h.engine.start_execution(id).await,
        Err(FlowError::Command(CommandError::AlreadyFinished(_)))
    ));
    assert!(matches!(
        h.engine.pause(id).await,
        Err(FlowError::Command(CommandError::UnknownExecution(_)))
    ));
}

#[tokio::test]
async fn test_finished_worker_answers_state() {
    let h = harness(Script::default(), workflow(&["A"]), EngineConfig::default()).await;
    let id = h.create().await;

    timeout(WAIT, h.engine.run_to_completion(id)).await.unwrap().unwrap();

    let state = h.engine.get_state(id).await.unwrap();
    assert_eq!(state.status, ProcessStatus::Completed);
    assert_eq!(state.completed_steps, vec!["A"]);

    // The worker is still idling, yet a finished execution cannot be started
    assert_eq!(h.engine.live_workers().await, 1);
    assert!(matches!(
        h.engine.start_execution(id).await,
        Err(FlowError::Command(CommandError::AlreadyFinished(_)))
    ));
    assert!(matches!(
        h.engine.resume(id).await,
        Err(FlowError::Command(CommandError::AlreadyFinished(_)))
    ));
}

#[tokio::test]
async fn test_disabled_step_is_skipped() {
    let definition = WorkflowDefinition::new("skips")
        .with_step(StepSpec::new("A", "test.script"))
        .with_step(StepSpec::new("B", "test.script").disabled())
        .with_step(StepSpec::new("C", "test.script"));
    let h = harness(Script::default(), definition, EngineConfig::default()).await;
    let id = h.create().await;

    let record = timeout(WAIT, h.engine.run_to_completion(id)).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.completed_step_ids, vec!["A", "C"]);
    assert!(!record.output_data.unwrap().contains_key("B"));

    let log = h.log(id).await;
    assert_eq!(count(&log, EventType::StepSkipped, "B"), 1);
    assert_eq!(count(&log, EventType::StepStarted, "B"), 0);
}

#[tokio::test]
async fn test_snapshot_policy_finalize_only() {
    let (script, gate) = Script::default().gate("C");
    let config = EngineConfig {
        snapshot_policy: SnapshotPolicy::FinalizeOnly,
        ..EngineConfig::default()
    };
    let h = harness(script, workflow(&["A", "B", "C"]), config).await;
    let id = h.create().await;

    h.engine.start_execution(id).await.unwrap();
    h.engine.execute(id).await.unwrap();
    timeout(WAIT, gate.entered.notified()).await.unwrap();
    assert!(h.engine.get_execution(id).await.unwrap().context_snapshot.is_none());

    gate.release.notify_one();
    let record = wait_terminal(&h.engine, id).await;
    assert_eq!(record.completed_step_ids, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_recover_brings_back_paused_and_running() {
    let definition = workflow(&["A", "B"]);
    let store = Arc::new(MemoryStore::new());
    init_tracing();

    // First host: one execution paused, one interrupted inside a step
    let (script, gate) = Script::default().gate("A");
    let first = FlowEngine::builder()
        .storage(store.clone())
        .executor(Arc::new(script))
        .build();
    let workflow_id = first.register_workflow(definition.clone()).await.unwrap();

    let paused = first.create_execution(workflow_id, "acct", Variables::new()).await.unwrap().id;
    first.start_execution(paused).await.unwrap();
    first.pause(paused).await.unwrap();

    let running = first.create_execution(workflow_id, "acct", Variables::new()).await.unwrap().id;
    first.start_execution(running).await.unwrap();
    first.execute(running).await.unwrap();
    timeout(WAIT, gate.entered.notified()).await.unwrap();
    first.shutdown().await;

    // Second host over the same storage
    let second = FlowEngine::builder()
        .storage(store.clone())
        .executor(Arc::new(Script::default()))
        .build();
    second.register_workflow(definition).await.unwrap();

    let report = second.recover().await.unwrap();
    assert_eq!(report.resumed, vec![running]);
    assert_eq!(report.paused, vec![paused]);
    assert!(report.failed.is_empty());

    let record = wait_terminal(&second, running).await;
    assert_eq!(record.status, ExecutionStatus::Completed);

    assert_eq!(second.get_state(paused).await.unwrap().status, ProcessStatus::Paused);
    second.resume(paused).await.unwrap();
    let record = wait_terminal(&second, paused).await;
    assert_eq!(record.status, ExecutionStatus::Completed);

    let log = second.events(&EventQuery::for_execution(paused)).await.unwrap();
    assert_eq!(
        log.iter()
            .filter(|e| e.event_type == EventType::ExecutionStarted)
            .count(),
        1
    );
    assert_eq!(count(&log, EventType::StepStarted, "A"), 1);

    let log = second.events(&EventQuery::for_execution(running)).await.unwrap();
    let recovered: Vec<_> = log
        .iter()
        .filter(|e| e.event_type == EventType::ExecutionStarted)
        .map(|e| e.payload["recovered"].clone())
        .collect();
    assert_eq!(recovered, vec![json!(false), json!(true)]);
}

#[tokio::test]
async fn test_stop_recovered_paused_worker() {
    let definition = workflow(&["A", "B"]);
    let store = Arc::new(MemoryStore::new());
    init_tracing();

    let first = FlowEngine::builder()
        .storage(store.clone())
        .executor(Arc::new(Script::default()))
        .build();
    let workflow_id = first.register_workflow(definition.clone()).await.unwrap();
    let id = first.create_execution(workflow_id, "acct", Variables::new()).await.unwrap().id;
    first.start_execution(id).await.unwrap();
    first.pause(id).await.unwrap();
    first.shutdown().await;

    let second = FlowEngine::builder()
        .storage(store.clone())
        .executor(Arc::new(Script::default()))
        .build();
    second.register_workflow(definition).await.unwrap();
    let report = second.recover().await.unwrap();
    assert_eq!(report.paused, vec![id]);

    let state = second.get_state(id).await.unwrap();
    assert_eq!(state.status, ProcessStatus::Paused);
    assert!(!state.loop_active);

    second.stop(id).await.unwrap();
    assert_eq!(store.get(id).await.unwrap().status, ExecutionStatus::Cancelled);
    wait_status(&second, id, ProcessStatus::Cancelled).await;

    let log = second.events(&EventQuery::for_execution(id)).await.unwrap();
    assert!(log.iter().all(|e| e.event_type != EventType::StepStarted));
    assert_eq!(log.last().unwrap().event_type, EventType::ExecutionCancelled);
}

#[tokio::test]
async fn test_unknown_workflow_rejected() {
    let engine = FlowEngine::new();
    assert!(matches!(
        engine
            .create_execution(WorkflowId::new_v4(), "acct", Variables::new())
            .await,
        Err(FlowError::Workflow(_))
    ));
}

#[tokio::test]
async fn test_watch_finished_execution_is_closed() {
    let h = harness(Script::default(), workflow(&["A"]), EngineConfig::default()).await;
    let id = h.create().await;
    timeout(WAIT, h.engine.run_to_completion(id)).await.unwrap().unwrap();

    let mut events = h.engine.watch_execution(id).await.unwrap();
    assert!(matches!(
        events.recv().await,
        Err(broadcast::error::RecvError::Closed)
    ));

    assert!(matches!(
        h.engine.watch_execution(ExecutionId::new_v4()).await,
        Err(FlowError::Store(_))
    ));
}
