//! Simrank - cross-encoder similarity ranking
//!
//! This library exposes the ranking component and the HTTP service built on
//! it, enabling integration tests and embedding in other applications.

pub mod config;
pub mod device;
pub mod document;
pub mod error;
pub mod handlers;
pub mod inference;
pub mod ranker;
pub mod shutdown;
pub mod state;

// Re-export key types for convenience
pub use config::Config;
pub use device::{ComponentDevice, Device, DeviceMap, DeviceMapSpec, Placement};
pub use document::Document;
pub use error::{AppError, Result};
pub use handlers::{config_handler, health_handler, rank_handler, ready_handler};
pub use inference::{EngineLoader, FnEngine, FnLoader, OnnxLoader, ScoringEngine};
pub use ranker::{ComponentRecord, ModelKwargs, RankerConfig, RunOptions, SimilarityRanker, Token};
pub use state::AppState;
