use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by the ranker and the service around it.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum AppError {
    /// Invalid construction parameters or per-call overrides.
    #[error("Invalid ranker configuration: {0}")]
    ConfigError(String),

    /// Ranking was requested before warm-up.
    #[error("Component not ready: {0}")]
    NotReady(String),

    #[error("Model inference failed: {0}")]
    ModelError(String),

    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("Service temporarily unavailable: {0}")]
    ResourceError(String),

    #[error("Tokenization failed: {0}")]
    TokenizationError(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ConfigError(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotReady(_) | AppError::ResourceError(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ModelError(_) | AppError::TokenizationError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable name for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConfigError(_) => "config",
            AppError::NotReady(_) => "not_ready",
            AppError::ModelError(_) => "model",
            AppError::ValidationError(_) => "validation",
            AppError::ResourceError(_) => "resource",
            AppError::TokenizationError(_) => "tokenization",
        }
    }

    /// Text returned to clients. Caller mistakes echo the bare message;
    /// engine failures keep their prefix.
    fn client_message(&self) -> String {
        match self {
            AppError::ConfigError(msg)
            | AppError::NotReady(msg)
            | AppError::ValidationError(msg)
            | AppError::ResourceError(msg) => msg.clone(),
            AppError::ModelError(_) | AppError::TokenizationError(_) => self.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    code: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        } else {
            tracing::warn!(kind = self.kind(), error = %self, "Request rejected");
        }

        let body = ErrorBody {
            error: self.client_message(),
            kind: self.kind(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ort::Error> for AppError {
    fn from(err: ort::Error) -> Self {
        AppError::ModelError(err.to_string())
    }
}

/// Malformed exported records.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
