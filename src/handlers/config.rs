use crate::error::Result;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde_json::Value;
use std::sync::Arc;

/// GET /config - The ranker's exported configuration record.
///
/// Secret tokens are never included.
pub async fn config_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    Ok(Json(state.ranker.to_record().to_value()?))
}
