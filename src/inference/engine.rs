//! Seams between the ranker and the model that scores its pairs.

use crate::device::Placement;
use crate::error::Result;
use crate::ranker::config::Token;
use crate::ranker::kwargs::ModelKwargs;
use crate::ranker::pairs::ScoredPair;
use std::sync::Arc;

/// A loaded cross-encoder.
///
/// Returns one raw relevance score per pair, in pair order. Implementations
/// are inference-only and never update their weights.
pub trait ScoringEngine: Send + Sync {
    fn score_pairs(&self, pairs: &[ScoredPair]) -> Result<Vec<f32>>;

    /// Placement chosen by the engine itself, when it differs from the request.
    fn placement(&self) -> Option<Placement> {
        None
    }
}

/// What warm-up asks an [`EngineLoader`] for.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub model: &'a str,
    pub token: Option<&'a Token>,
    pub placement: &'a Placement,
    pub model_kwargs: &'a ModelKwargs,
}

/// Creates scoring engines at warm-up.
pub trait EngineLoader: Send + Sync {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn ScoringEngine>>;
}

/// Engine backed by a plain scoring function.
pub struct FnEngine<F> {
    scorer: Arc<F>,
}

impl<F> FnEngine<F>
where
    F: Fn(&[ScoredPair]) -> Result<Vec<f32>> + Send + Sync,
{
    pub fn new(scorer: F) -> Self {
        Self {
            scorer: Arc::new(scorer),
        }
    }
}

impl<F> ScoringEngine for FnEngine<F>
where
    F: Fn(&[ScoredPair]) -> Result<Vec<f32>> + Send + Sync,
{
    fn score_pairs(&self, pairs: &[ScoredPair]) -> Result<Vec<f32>> {
        (self.scorer)(pairs)
    }
}

/// Loader that hands out [`FnEngine`]s sharing one scoring function.
pub struct FnLoader<F> {
    scorer: Arc<F>,
}

impl<F> FnLoader<F>
where
    F: Fn(&[ScoredPair]) -> Result<Vec<f32>> + Send + Sync + 'static,
{
    pub fn new(scorer: F) -> Self {
        Self {
            scorer: Arc::new(scorer),
        }
    }
}

impl<F> EngineLoader for FnLoader<F>
where
    F: Fn(&[ScoredPair]) -> Result<Vec<f32>> + Send + Sync + 'static,
{
    fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn ScoringEngine>> {
        tracing::debug!(model = request.model, "Loading function-backed scoring engine");
        Ok(Box::new(FnEngine {
            scorer: Arc::clone(&self.scorer),
        }))
    }
}
