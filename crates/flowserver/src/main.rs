use actix_cors::Cors;
use actix_web::http::StatusCode;
use actix_web::{
    delete, get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use flowcore::{
    CommandError, EventQuery, EventType, ExecutionStatus, FileStore, FlowError, ProgressEvent,
    StoreError, Variables, WorkflowDefinition, WorkflowError,
};
use flowexec::{EngineConfig, FlowEngine, WorkflowLoader};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Application state shared across handlers
struct AppState {
    engine: Arc<FlowEngine>,
    /// Where submitted workflows are saved, when running on a data directory
    loader: Option<WorkflowLoader>,
}

/// Request body for creating an execution
#[derive(Debug, Deserialize)]
struct CreateExecutionRequest {
    account_id: String,
    #[serde(default)]
    input_data: Variables,
    /// Start the worker and execute right away
    #[serde(default)]
    execute: bool,
}

#[derive(Debug, Deserialize)]
struct ListExecutionsParams {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    event_type: Option<String>,
    /// `asc` (default) or `desc`
    order: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    steps_only: bool,
}

/// Response for workflow creation
#[derive(Debug, Serialize)]
struct WorkflowResponse {
    id: Uuid,
    message: String,
}

/// Frame pushed to WebSocket subscribers
#[derive(Debug, Serialize)]
struct ProgressFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    event: &'a ProgressEvent,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn status_for(e: &FlowError) -> StatusCode {
    match e {
        FlowError::Workflow(WorkflowError::NotFound(_))
        | FlowError::Store(StoreError::ExecutionNotFound(_))
        | FlowError::Command(CommandError::UnknownExecution(_)) => StatusCode::NOT_FOUND,
        FlowError::Command(CommandError::WorkerUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        FlowError::Command(_)
        | FlowError::Store(StoreError::InvalidTransition { .. })
        | FlowError::Store(StoreError::AlreadyExists(_)) => StatusCode::CONFLICT,
        FlowError::Workflow(_) | FlowError::Step(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &FlowError) -> HttpResponse {
    let status = status_for(e);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    HttpResponse::build(status).json(ErrorResponse {
        error: e.to_string(),
    })
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse { error: message })
}

/// Health check endpoint
#[get("/health")]
async fn health_check(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "flowengine",
        "live_workers": data.engine.live_workers().await,
    }))
}

/// List all workflows
#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> impl Responder {
    let workflows: Vec<_> = data
        .engine
        .workflows()
        .await
        .iter()
        .map(|w| {
            serde_json::json!({
                "id": w.id,
                "name": w.name,
                "description": w.description,
                "steps": w.steps.len(),
            })
        })
        .collect();

    HttpResponse::Ok().json(workflows)
}

/// Register a new workflow
#[post("/api/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    workflow: web::Json<WorkflowDefinition>,
) -> impl Responder {
    let workflow = workflow.into_inner();
    info!("Creating workflow: {} ({})", workflow.name, workflow.id);

    let workflow_id = match data.engine.register_workflow(workflow.clone()).await {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    if let Some(loader) = &data.loader {
        if let Err(e) = loader.save(&workflow).await {
            return error_response(&e);
        }
    }

    HttpResponse::Created().json(WorkflowResponse {
        id: workflow_id,
        message: "Workflow created successfully".to_string(),
    })
}

/// Get a specific workflow
#[get("/api/workflows/{id}")]
async fn get_workflow(data: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    let workflow_id = path.into_inner();
    match data.engine.workflow(workflow_id).await {
        Some(workflow) => HttpResponse::Ok().json(workflow),
        None => error_response(&WorkflowError::NotFound(workflow_id.to_string()).into()),
    }
}

/// Delete a workflow
#[delete("/api/workflows/{id}")]
async fn delete_workflow(data: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    let workflow_id = path.into_inner();
    if data.engine.remove_workflow(workflow_id).await.is_none() {
        return error_response(&WorkflowError::NotFound(workflow_id.to_string()).into());
    }
    if let Some(loader) = &data.loader {
        if let Err(e) = loader.remove(workflow_id).await {
            return error_response(&e);
        }
    }

    HttpResponse::Ok().json(serde_json::json!({
        "message": "Workflow deleted successfully"
    }))
}

/// Create an execution of a workflow, optionally running it
#[post("/api/workflows/{id}/executions")]
async fn create_execution(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: web::Json<CreateExecutionRequest>,
) -> impl Responder {
    let workflow_id = path.into_inner();
    let req = req.into_inner();
    let engine = &data.engine;

    let execution = match engine
        .create_execution(workflow_id, req.account_id, req.input_data)
        .await
    {
        Ok(execution) => execution,
        Err(e) => return error_response(&e),
    };

    if req.execute {
        let started = match engine.start_execution(execution.id).await {
            Ok(handle) => handle.execute().await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            return error_response(&e);
        }
    }

    HttpResponse::Created().json(execution)
}

/// List execution records, optionally by status
#[get("/api/executions")]
async fn list_executions(
    data: web::Data<AppState>,
    params: web::Query<ListExecutionsParams>,
) -> impl Responder {
    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<ExecutionStatus>() {
            Ok(status) => Some(status),
            Err(_) => return bad_request(format!("Unknown status '{}'", raw)),
        },
    };

    match data.engine.list_executions(status).await {
        Ok(executions) => HttpResponse::Ok().json(executions),
        Err(e) => error_response(&e),
    }
}

/// Get an execution record
#[get("/api/executions/{id}")]
async fn get_execution(data: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    match data.engine.get_execution(path.into_inner()).await {
        Ok(execution) => HttpResponse::Ok().json(execution),
        Err(e) => error_response(&e),
    }
}

/// Send a control command to the worker of an execution
#[post("/api/executions/{id}/{command}")]
async fn control_execution(
    data: web::Data<AppState>,
    path: web::Path<(Uuid, String)>,
) -> impl Responder {
    let (execution_id, command) = path.into_inner();
    let engine = &data.engine;

    let result = match command.as_str() {
        "start" => engine.start_execution(execution_id).await.map(|_| ()),
        "execute" => engine.execute(execution_id).await,
        "pause" => engine.pause(execution_id).await,
        "resume" => engine.resume(execution_id).await,
        "stop" => engine.stop(execution_id).await,
        other => return HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Unknown command '{}'", other),
        }),
    };

    match result {
        Ok(()) => {
            info!("Execution {} accepted {}", execution_id, command);
            HttpResponse::Accepted().json(serde_json::json!({
                "execution_id": execution_id,
                "command": command,
            }))
        }
        Err(e) => error_response(&e),
    }
}

/// Live state of an execution's worker
#[get("/api/executions/{id}/state")]
async fn execution_state(data: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    match data.engine.get_state(path.into_inner()).await {
        Ok(snapshot) => HttpResponse::Ok().json(snapshot),
        Err(e) => error_response(&e),
    }
}

/// Query the event log of an execution
#[get("/api/executions/{id}/events")]
async fn execution_events(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    params: web::Query<EventsParams>,
) -> impl Responder {
    let execution_id = path.into_inner();
    if let Err(e) = data.engine.get_execution(execution_id).await {
        return error_response(&e);
    }

    let mut query = EventQuery::for_execution(execution_id);
    if let Some(raw) = &params.event_type {
        match raw.parse::<EventType>() {
            Ok(event_type) => query = query.with_event_type(event_type),
            Err(_) => return bad_request(format!("Unknown event type '{}'", raw)),
        }
    }
    match params.order.as_deref() {
        None | Some("asc") => {}
        Some("desc") => query = query.reverse(),
        Some(other) => return bad_request(format!("Unknown order '{}'", other)),
    }
    if let Some(limit) = params.limit {
        query = query.limit(limit);
    }
    if params.steps_only {
        query = query.steps_only();
    }

    match data.engine.events(&query).await {
        Ok(events) => HttpResponse::Ok().json(events),
        Err(e) => error_response(&e),
    }
}

/// WebSocket endpoint for progress of every execution
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let events = data.engine.subscribe();
    stream_progress(&req, stream, events, "all executions".to_string())
}

/// WebSocket endpoint for progress of one execution, closed when it finishes
#[get("/api/executions/{id}/events/ws")]
async fn websocket_execution_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<HttpResponse> {
    let execution_id = path.into_inner();
    match data.engine.watch_execution(execution_id).await {
        Ok(events) => stream_progress(&req, stream, events, execution_id.to_string()),
        Err(e) => Ok(error_response(&e)),
    }
}

fn stream_progress(
    req: &actix_web::HttpRequest,
    stream: web::Payload,
    mut events: broadcast::Receiver<ProgressEvent>,
    label: String,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(req, stream)?;

    info!("WebSocket client connected to {}", label);

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            let frame = ProgressFrame { kind: "workflow_progress", event: &event };
                            if let Ok(json) = serde_json::to_string(&frame) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client on {} skipped {} events", label, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected from {}", label);
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// List available step types
#[get("/api/steps")]
async fn list_step_types(data: web::Data<AppState>) -> impl Responder {
    let registry = data.engine.steps();
    let steps: Vec<_> = registry
        .list_step_types()
        .iter()
        .map(|step_type| {
            let metadata = registry.get_metadata(step_type);
            serde_json::json!({
                "type": step_type,
                "description": metadata.as_ref().map(|m| m.description.clone()).unwrap_or_default(),
                "category": metadata.as_ref().map(|m| m.category.clone()).unwrap_or_default(),
            })
        })
        .collect();

    HttpResponse::Ok().json(steps)
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_workflows)
        .service(create_workflow)
        .service(get_workflow)
        .service(delete_workflow)
        .service(create_execution)
        .service(list_executions)
        .service(websocket_events)
        .service(list_step_types)
        .service(get_execution)
        .service(execution_state)
        .service(execution_events)
        .service(websocket_execution_events)
        .service(control_execution);
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting Flow Engine Server");

    let builder = FlowEngine::builder()
        .config(EngineConfig::from_env())
        .steps(flowsteps::standard_registry());

    let (engine, loader) = match std::env::var("FLOW_DATA_DIR") {
        Ok(dir) => {
            let store = FileStore::open(&dir).await?;
            let loader = WorkflowLoader::new(Path::new(&dir).join("workflows"));
            (builder.storage(Arc::new(store)).build(), Some(loader))
        }
        Err(_) => {
            info!("FLOW_DATA_DIR not set, executions are kept in memory");
            (builder.build(), None)
        }
    };

    if let Some(loader) = &loader {
        loader.load_into(&engine).await?;
    }
    let report = engine.recover().await?;
    info!(
        "✅ Engine ready: {} resumed, {} paused, {} not recovered",
        report.resumed.len(),
        report.paused.len(),
        report.failed.len()
    );

    let engine = Arc::new(engine);
    let app_state = web::Data::new(AppState {
        engine: engine.clone(),
        loader,
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    engine.shutdown().await;
    Ok(())
}
