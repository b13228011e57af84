use crate::config::Config;
use crate::document::Document;
use crate::error::Result;
use crate::inference::{EngineLoader, OnnxLoader};
use crate::ranker::{RunOptions, SimilarityRanker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Application state shared across all request handlers.
pub struct AppState {
    pub ranker: Arc<SimilarityRanker>,
    pub semaphore: Arc<Semaphore>,
    /// Flag indicating the ranker is warmed up
    pub ready: AtomicBool,
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds and warms up the ranker from `config` with the ONNX engine.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_loader(config, Arc::new(OnnxLoader::new()))
    }

    /// Builds and warms up the ranker with a custom engine loader.
    ///
    /// # Semaphore Strategy
    /// Permits = cores / intra_threads, so concurrent inferences never
    /// oversubscribe the CPU.
    pub fn with_loader(config: Config, loader: Arc<dyn EngineLoader>) -> Result<Self> {
        let permits = config.effective_permits();
        tracing::info!(permits, mode = ?config.mode(), "Configured request permits");

        let mut ranker = SimilarityRanker::new(config.ranker_config()?, loader)?;
        ranker.warm_up()?;
        prime(&ranker)?;

        let state = Self {
            ranker: Arc::new(ranker),
            semaphore: Arc::new(Semaphore::new(permits)),
            ready: AtomicBool::new(false),
            config: Arc::new(config),
        };

        state.ready.store(state.ranker.is_warmed_up(), Ordering::SeqCst);

        Ok(state)
    }

    /// Check if the service is ready to handle requests.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Run one throwaway ranking so lazy initialization inside the engine happens
/// before the first real request.
fn prime(ranker: &SimilarityRanker) -> Result<()> {
    tracing::info!("Running ranker warmup inference...");

    let mut documents = vec![Document::new("warmup document")];
    ranker.run("warmup query", &mut documents, RunOptions::default())?;

    tracing::info!("Ranker warmup inference completed");
    Ok(())
}
