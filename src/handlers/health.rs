use crate::state::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Rank requests that could start right now.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_permits: Option<usize>,
}

impl HealthResponse {
    fn bare(status: &'static str) -> Self {
        Self {
            status,
            version: VERSION,
            model: None,
            free_permits: None,
        }
    }
}

/// GET /health - liveness only, never touches the ranker.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::bare("healthy"))
}

/// GET /ready - 200 once the ranker is warmed up, 503 before.
pub async fn ready_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };

    let response = HealthResponse {
        model: Some(state.ranker.config().model.clone()),
        free_permits: Some(state.semaphore.available_permits()),
        ..HealthResponse::bare(status)
    };
    (code, Json(response))
}
