use serde::{Deserialize, Serialize};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RunTaskRequest {
    pub task: String,
    pub trace_id: String,

    #[serde(default)]
    pub selected_screen: Option<u32>,

    #[serde(default)]
    pub max_steps: Option<u32>,

    /// Grounding service endpoint; falls back to the server default.
    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default)]
    pub retry_limit: Option<u32>,

    #[serde(default)]
    pub verify_failure_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunTaskResponse {
    pub status: String,
    pub session_id: String,
    pub task: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
