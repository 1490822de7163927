use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{
    EventLog, EventQuery, EventType, ExecutionId, ExecutionStatus, ExecutionStore, FileStore,
    ProgressEvent, StepSpec, Variables, WorkflowDefinition,
};
use flowexec::{order_steps, EngineConfig, FlowEngine, WorkflowLoader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Persist the execution under this directory so it can be recovered
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available step types
    Steps,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },

    /// List execution records in a data directory
    Executions {
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Only executions with this status
        #[arg(short, long)]
        status: Option<ExecutionStatus>,
    },

    /// Query the event log of an execution
    Events {
        #[arg(short, long)]
        data_dir: PathBuf,

        execution_id: ExecutionId,

        /// Only events of this type
        #[arg(short = 't', long)]
        event_type: Option<EventType>,

        /// Show only the newest N events, newest first
        #[arg(short = 'n', long)]
        last: Option<usize>,

        /// Exclude execution-level events
        #[arg(long)]
        steps_only: bool,
    },

    /// Resume executions left running or paused in a data directory
    Recover {
        #[arg(short, long)]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::Run { file, input, data_dir } => {
            run_workflow(file, input, data_dir).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(file).await?;
        }

        Commands::Steps => {
            list_steps();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }

        Commands::Executions { data_dir, status } => {
            list_executions(data_dir, status).await?;
        }

        Commands::Events {
            data_dir,
            execution_id,
            event_type,
            last,
            steps_only,
        } => {
            let mut query = EventQuery::for_execution(execution_id);
            if let Some(event_type) = event_type {
                query = query.with_event_type(event_type);
            }
            if let Some(n) = last {
                query = query.most_recent(n);
            }
            if steps_only {
                query = query.steps_only();
            }
            show_events(data_dir, query).await?;
        }

        Commands::Recover { data_dir } => {
            recover(data_dir).await?;
        }
    }

    Ok(())
}

/// Engine with the standard steps, persisting under `data_dir` when given
async fn build_engine(data_dir: Option<&Path>) -> Result<FlowEngine> {
    let builder = FlowEngine::builder()
        .config(EngineConfig::from_env())
        .steps(flowsteps::standard_registry());

    Ok(match data_dir {
        Some(dir) => builder.storage(Arc::new(FileStore::open(dir).await?)).build(),
        None => builder.build(),
    })
}

fn workflow_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("workflows")
}

fn parse_input(input: Option<String>) -> Result<Variables> {
    let Some(raw) = input else {
        return Ok(Variables::new());
    };
    match serde_json::from_str::<serde_json::Value>(&raw).context("Input is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("Input must be a JSON object"),
    }
}

async fn run_workflow(file: PathBuf, input: Option<String>, data_dir: Option<PathBuf>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = WorkflowLoader::read_file(&file)
        .await
        .with_context(|| format!("Could not read {}", file.display()))?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Steps: {}", workflow.steps.len());
    println!();

    let input_data = parse_input(input)?;
    let engine = build_engine(data_dir.as_deref()).await?;

    if let Some(dir) = &data_dir {
        WorkflowLoader::new(workflow_dir(dir)).save(&workflow).await?;
    }
    let workflow_id = engine.register_workflow(workflow).await?;
    let execution = engine.create_execution(workflow_id, "cli", input_data).await?;

    let printer = tokio::spawn(print_progress(engine.subscribe_execution(execution.id).await));
    let record = engine.run_to_completion(execution.id).await?;
    let _ = printer.await;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", record.id);
    println!("   Status: {}", record.status);
    println!("   Completed steps: {}", record.completed_step_ids.join(", "));

    if let Some(output) = record.output_data.as_ref().filter(|o| !o.is_empty()) {
        println!();
        println!("📤 Outputs:");
        for (key, value) in output {
            println!("   {}: {}", key, value);
        }
    }

    if record.status != ExecutionStatus::Completed {
        bail!(
            "Execution {} ended {}: {}",
            record.id,
            record.status,
            record.error_message.unwrap_or_default()
        );
    }
    Ok(())
}

/// Print progress until the execution's stream closes
async fn print_progress(mut events: broadcast::Receiver<ProgressEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let step = event.step_id.as_deref().unwrap_or("-");

        match event.event_type {
            EventType::ExecutionStarted => println!("▶️  Execution started"),
            EventType::ExecutionPaused => println!("⏸️  Execution paused"),
            EventType::ExecutionResumed => println!("▶️  Execution resumed"),
            EventType::StepStarted => println!("  ⚡ Starting step: {}", step),
            EventType::StepCompleted => println!("  ✅ Step {} completed", step),
            EventType::StepSkipped => {
                println!("  ⏭️  Step {} skipped ({})", step, payload_str(&event, "reason"))
            }
            EventType::StepFailed => println!("  ❌ Step {} failed: {}", step, payload_str(&event, "error")),
            EventType::VariableUpdated => {
                println!("     ℹ️  [{}] {} updated", step, payload_str(&event, "key"))
            }
            EventType::ExecutionCompleted => println!("✨ Execution completed successfully"),
            EventType::ExecutionFailed => {
                println!("💥 Execution failed: {}", payload_str(&event, "error_message"))
            }
            EventType::ExecutionCancelled => println!("🛑 Execution cancelled"),
            other => println!("     [{}] {}", step, other),
        }
    }
}

/// Wait for the terminal event or the end of the stream; lag is not an end
async fn await_terminal(mut events: broadcast::Receiver<ProgressEvent>) -> Option<EventType> {
    loop {
        match events.recv().await {
            Ok(event) if event.event_type.is_terminal() => return Some(event.event_type),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn payload_str<'a>(event: &'a ProgressEvent, key: &str) -> &'a str {
    event.payload.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

async fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = WorkflowLoader::read_file(&file).await?;
    let ordered = order_steps(&workflow)?;
    flowsteps::standard_registry().validate(&workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Steps: {}", workflow.steps.len());
    println!(
        "   Order: {}",
        ordered.iter().map(|s| s.id.as_str()).collect::<Vec<_>>().join(" -> ")
    );

    Ok(())
}

fn list_steps() {
    println!("📦 Available Step Types:");
    println!();

    let registry = flowsteps::standard_registry();
    for step_type in registry.list_step_types() {
        if let Some(metadata) = registry.get_metadata(&step_type) {
            println!("  • {} ({})", step_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", step_type);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = WorkflowDefinition::new("Example Workflow");
    workflow.description = Some("Parses a JSON payload and logs one of its fields".to_string());

    let defaults = workflow.add_step(
        StepSpec::new("defaults", "vars.set")
            .with_name("Set Defaults")
            .with_config("values", serde_json::json!({"payload": "{\"greeting\": \"hello\"}"})),
    );
    let parse = workflow.add_step(
        StepSpec::new("parse", "transform.json_parse")
            .with_name("Parse Payload")
            .with_config("from", "payload")
            .depends_on(defaults),
    );
    workflow.add_step(
        StepSpec::new("log", "debug.log")
            .with_name("Log Greeting")
            .with_config("message", "parsed payload")
            .with_config("path", "parse.parsed.greeting")
            .depends_on(parse),
    );

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run --file {}", output.display());

    Ok(())
}

async fn list_executions(data_dir: PathBuf, status: Option<ExecutionStatus>) -> Result<()> {
    let store = FileStore::open(&data_dir).await?;
    let mut executions = match status {
        Some(status) => store.list_by_status(status).await?,
        None => store.list().await?,
    };
    executions.sort_by_key(|e| e.inserted_at);

    if executions.is_empty() {
        println!("No executions in {}", data_dir.display());
    }
    for execution in executions {
        println!(
            "{}  {:<10}  workflow {}  steps done {}{}",
            execution.id,
            execution.status.as_str(),
            execution.workflow_id,
            execution.completed_step_ids.len(),
            execution
                .error_message
                .map(|m| format!("  error: {}", m))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn show_events(data_dir: PathBuf, query: EventQuery) -> Result<()> {
    let store = FileStore::open(&data_dir).await?;
    let events = store.query(&query).await?;

    for event in events {
        println!(
            "{}  {:<22}  {:<12}  {}",
            event.inserted_at.format("%H:%M:%S%.3f"),
            event.event_type.as_str(),
            event.step_id.as_deref().unwrap_or("-"),
            serde_json::Value::Object(event.payload)
        );
    }
    Ok(())
}

async fn recover(data_dir: PathBuf) -> Result<()> {
    tracing::info!("Recovering executions from {}", data_dir.display());
    let engine = build_engine(Some(&data_dir)).await?;
    WorkflowLoader::new(workflow_dir(&data_dir))
        .load_into(&engine)
        .await?;

    let report = engine.recover().await?;
    println!("🔁 Recovery:");
    println!("   Resumed: {}", report.resumed.len());
    println!("   Paused: {}", report.paused.len());
    for (id, reason) in &report.failed {
        println!("   ❌ {}: {}", id, reason);
    }

    for id in &report.resumed {
        await_terminal(engine.watch_execution(*id).await?).await;
        let record = engine.get_execution(*id).await?;
        println!("   {} ended {}", id, record.status);
    }

    engine.shutdown().await;
    Ok(())
}
