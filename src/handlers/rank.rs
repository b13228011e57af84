use crate::document::Document;
use crate::error::{AppError, Result};
use crate::ranker::config::top_k_from_i64;
use crate::ranker::RunOptions;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct RankRequest {
    pub query: String,
    pub documents: Vec<Document>,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub scale_score: Option<bool>,
    #[serde(default)]
    pub calibration_factor: Option<f64>,
    #[serde(default)]
    pub score_threshold: Option<f64>,
}

impl RankRequest {
    fn options(&self) -> Result<RunOptions> {
        Ok(RunOptions {
            top_k: self.top_k.map(top_k_from_i64).transpose()?,
            scale_score: self.scale_score,
            calibration_factor: self.calibration_factor,
            score_threshold: self.score_threshold,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RankResponse {
    pub documents: Vec<Document>,
}

/// POST /rank - Rank documents by relevance to query.
///
/// # Flow
/// 1. Validate input and per-call overrides
/// 2. Acquire semaphore permit (blocks if all CPUs busy)
/// 3. Run the ranker on the blocking pool
/// 4. Return the ranked documents with their scores
pub async fn rank_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RankRequest>,
) -> Result<Json<RankResponse>> {
    if request.query.is_empty() {
        return Err(AppError::ValidationError(
            "Query cannot be empty".to_string(),
        ));
    }
    let max_docs = state.config.max_documents;
    if request.documents.len() > max_docs {
        return Err(AppError::ValidationError(format!(
            "Maximum {} documents per request",
            max_docs
        )));
    }
    let options = request.options()?;

    let batch_size = request.documents.len();

    // Acquire semaphore with timeout (503 if service overloaded)
    let _permit = tokio::time::timeout(Duration::from_secs(5), state.semaphore.acquire())
        .await
        .map_err(|_| {
            AppError::ResourceError("Service temporarily overloaded, please retry".to_string())
        })?
        .map_err(|_| AppError::ResourceError("Semaphore closed".to_string()))?;

    let ranker = Arc::clone(&state.ranker);
    let query = request.query;
    let mut documents = request.documents;

    // Run CPU-bound work in blocking task pool with timeout
    let inference_timeout = Duration::from_secs(30);
    let ranked = tokio::time::timeout(
        inference_timeout,
        tokio::task::spawn_blocking(move || {
            ranker
                .run(&query, &mut documents, options)
                .map(|ranked| ranked.into_iter().cloned().collect::<Vec<Document>>())
        }),
    )
    .await
    .map_err(|_| AppError::ResourceError("Inference timeout exceeded (30s)".to_string()))?
    .map_err(|e| AppError::ModelError(format!("Task join error: {}", e)))??;

    tracing::debug!(batch_size, returned = ranked.len(), "Rank completed");

    metrics::counter!("rank_requests_total").increment(1);
    metrics::histogram!("rank_batch_size").record(batch_size as f64);
    metrics::histogram!("rank_documents_returned").record(ranked.len() as f64);

    Ok(Json(RankResponse { documents: ranked }))
}
