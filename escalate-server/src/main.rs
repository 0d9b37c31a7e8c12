use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

use escalate_core::{
    Channel, ChannelDispatcher, EscalationEngine, EscalationError, EscalationIntent,
    EscalationRun, MemoryStore, RunSummary, Scheduler, SimulationResult, SystemClock,
    WorkflowDefinition, WorkflowStep,
};

// Application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EscalationEngine>,
}

// API types
#[derive(Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

#[derive(Deserialize)]
pub struct PutWorkflowRequest {
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct CreateEscalationRequest {
    pub group_id: String,
    pub member_id: String,
    /// Minor units (cents).
    pub amount_due: i64,
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    pub approver: String,
}

#[derive(Deserialize)]
pub struct TestWorkflowRequest {
    pub group_id: String,
    pub member_name: String,
    pub amount_due: i64,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Engine error mapped to an HTTP status plus the standard envelope.
struct ApiError(EscalationError);

impl From<EscalationError> for ApiError {
    fn from(e: EscalationError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EscalationError::Validation(_) => StatusCode::BAD_REQUEST,
            EscalationError::UnknownRun(_) | EscalationError::UnknownWorkflow(_) => {
                StatusCode::NOT_FOUND
            }
            EscalationError::InvalidTransition { .. } | EscalationError::WorkflowDisabled(_) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "Request failed");
        }
        let body = Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        });
        (status, body).into_response()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "escalate_server=info,escalate_core=info,tower_http=debug".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let (dispatcher, intent_rx) = ChannelDispatcher::new(1024);
    let engine = Arc::new(EscalationEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(dispatcher),
        Arc::new(SystemClock),
    ));

    // Intent consumer: in production this feeds the notification service;
    // here every decision is logged as it comes off the queue.
    tokio::spawn(consume_intents(intent_rx));

    // Scheduler sweep with coordinated shutdown
    let sweep_secs = std::env::var("SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60u64);
    let scheduler = Scheduler::new(engine.clone(), Duration::from_secs(sweep_secs));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    let app = create_router(AppState { engine });

    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse::<u16>()
        .unwrap_or(3000);
    let addr = format!("0.0.0.0:{}", port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    Ok(())
}

async fn consume_intents(mut rx: tokio::sync::mpsc::Receiver<EscalationIntent>) {
    while let Some(intent) = rx.recv().await {
        match intent {
            EscalationIntent::Execution {
                run_id,
                step_index,
                step_type,
                channels,
                message,
            } => {
                let channels: Vec<&str> = channels.iter().map(Channel::as_str).collect();
                info!(
                    run_id = %run_id,
                    step_index,
                    step = %step_type,
                    channels = channels.join(","),
                    message,
                    "Notification intent"
                );
            }
            EscalationIntent::ApprovalRequest {
                run_id,
                step_index,
                step_type,
            } => {
                info!(
                    run_id = %run_id,
                    step_index,
                    step = %step_type,
                    "Approval requested"
                );
            }
        }
    }
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/groups/:group_id/workflow",
            get(get_workflow).put(put_workflow),
        )
        .route("/api/groups/:group_id/escalations", get(list_escalations))
        .route("/api/escalations", post(create_escalation))
        .route("/api/escalations/:id", get(get_escalation))
        .route("/api/escalations/:id/pause", post(pause_escalation))
        .route("/api/escalations/:id/resume", post(resume_escalation))
        .route("/api/escalations/:id/cancel", post(cancel_escalation))
        .route("/api/escalations/:id/approve", post(approve_escalation))
        .route("/api/escalations/:id/resolve", post(resolve_escalation))
        .route("/api/workflow/test", post(test_workflow))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

// Health check endpoint
async fn health_check() -> Json<ApiResponse<String>> {
    ApiResponse::ok("OK".to_string())
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, ApiError> {
    let def = state.engine.get_definition(&group_id).await?;
    Ok(ApiResponse::ok(def))
}

async fn put_workflow(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<PutWorkflowRequest>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, ApiError> {
    let saved = state
        .engine
        .put_definition(WorkflowDefinition {
            group_id,
            steps: req.steps,
            enabled: req.enabled,
        })
        .await?;
    Ok(ApiResponse::ok(saved))
}

async fn list_escalations(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<RunSummary>>>, ApiError> {
    let runs = state.engine.active_runs(&group_id).await?;
    Ok(ApiResponse::ok(runs))
}

async fn create_escalation(
    State(state): State<AppState>,
    Json(req): Json<CreateEscalationRequest>,
) -> Result<(StatusCode, Json<ApiResponse<EscalationRun>>), ApiError> {
    let run = state
        .engine
        .start_run(&req.group_id, req.member_id, req.amount_due)
        .await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(run)))
}

async fn get_escalation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<EscalationRun>>, ApiError> {
    let run = state.engine.get_run(id).await?;
    Ok(ApiResponse::ok(run))
}

async fn pause_escalation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<EscalationRun>>, ApiError> {
    Ok(ApiResponse::ok(state.engine.pause(id).await?))
}

async fn resume_escalation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<EscalationRun>>, ApiError> {
    Ok(ApiResponse::ok(state.engine.resume(id).await?))
}

async fn cancel_escalation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<EscalationRun>>, ApiError> {
    Ok(ApiResponse::ok(state.engine.cancel(id).await?))
}

async fn approve_escalation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<ApiResponse<EscalationRun>>, ApiError> {
    Ok(ApiResponse::ok(state.engine.approve(id, &req.approver).await?))
}

async fn resolve_escalation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<EscalationRun>>, ApiError> {
    Ok(ApiResponse::ok(state.engine.mark_resolved(id).await?))
}

async fn test_workflow(
    State(state): State<AppState>,
    Json(req): Json<TestWorkflowRequest>,
) -> Result<Json<ApiResponse<SimulationResult>>, ApiError> {
    let result = state
        .engine
        .simulate(
            &req.group_id,
            &req.member_name,
            req.amount_due,
            req.seed.unwrap_or(0),
        )
        .await?;
    Ok(ApiResponse::ok(result))
}
