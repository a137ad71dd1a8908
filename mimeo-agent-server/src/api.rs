use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::info;

use mimeo::{AgentError, GroundingClient, Screen, Session, SessionConfig};

use crate::types::{HealthResponse, RunTaskRequest, RunTaskResponse, StopResponse};
use crate::AppState;

// ============================================================================
// Error Handling
// ============================================================================

pub struct ApiError(AgentError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::SessionBusy(_) => StatusCode::CONFLICT,
            AgentError::TraceNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::TraceMalformed(_) | AgentError::InvalidArgument(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string()
            })),
        )
            .into_response()
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        ApiError(err)
    }
}

// ============================================================================
// Health Check
// ============================================================================

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Run Task
// ============================================================================

pub async fn run_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunTaskRequest>,
) -> Result<Json<RunTaskResponse>, ApiError> {
    info!("📥 POST /run_task - trace: {}", request.trace_id);

    // Trace problems surface synchronously, before a session exists.
    let trace = state.trace_store.load(&request.trace_id)?;

    let mut config = SessionConfig::new(request.task.clone(), request.trace_id.clone());
    config.selected_screen = request.selected_screen.unwrap_or(state.selected_screen);
    config.max_steps = request.max_steps.unwrap_or(state.max_steps);
    if let Some(retry_limit) = request.retry_limit {
        config.retry_limit = retry_limit;
    }
    if let Some(verify_failure_limit) = request.verify_failure_limit {
        config.verify_failure_limit = verify_failure_limit;
    }

    let endpoint = request
        .server_url
        .unwrap_or_else(|| state.server_url.clone());
    let screen = Screen::new(state.driver.clone(), config.selected_screen);
    let grounder = Arc::new(GroundingClient::new(endpoint));

    let session = Session::new(config, trace, screen, grounder);
    let handle = session.handle();
    state.registry.begin(handle.clone()).await?;

    // The loop runs independently of this request; callers poll /status.
    tokio::spawn(session.run());

    let session_id = handle.session_id().to_string();
    info!("✅ Task started: session={session_id}");

    Ok(Json(RunTaskResponse {
        status: "started".to_string(),
        session_id,
        task: request.task,
    }))
}

// ============================================================================
// Stop
// ============================================================================

pub async fn stop(State(state): State<Arc<AppState>>) -> Json<StopResponse> {
    info!("📥 POST /stop");

    state.registry.stop().await;

    Json(StopResponse {
        status: "success".to_string(),
        message: "Stop signal sent".to_string(),
    })
}

// ============================================================================
// Get Status
// ============================================================================

pub async fn status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match state.registry.snapshot().await {
        Some(snapshot) => serde_json::json!({
            "status": snapshot.status,
            "session": snapshot
        }),
        None => serde_json::json!({
            "status": "idle"
        }),
    };

    Ok(Json(status))
}
