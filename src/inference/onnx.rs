//! ONNX Runtime backed scoring engine.

use crate::device::{Device, Placement};
use crate::error::{AppError, Result};
use crate::inference::engine::{EngineLoader, LoadRequest, ScoringEngine};
use crate::inference::model::CrossEncoderModel;
use crate::inference::tokenize::PairTokenizer;
use crate::ranker::kwargs::DType;
use crate::ranker::pairs::ScoredPair;
use std::path::{Path, PathBuf};

pub const DEFAULT_ONNX_FILE: &str = "model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const DEFAULT_MAX_LENGTH: usize = 512;

pub struct OnnxEngine {
    model: CrossEncoderModel,
    tokenizer: PairTokenizer,
}

impl OnnxEngine {
    pub fn new(model: CrossEncoderModel, tokenizer: PairTokenizer) -> Self {
        Self { model, tokenizer }
    }
}

impl ScoringEngine for OnnxEngine {
    fn score_pairs(&self, pairs: &[ScoredPair]) -> Result<Vec<f32>> {
        let batch = self.tokenizer.encode(pairs)?;
        self.model.score(&batch)
    }
}

/// Loads cross-encoders exported to ONNX from the local filesystem.
///
/// The model identifier is either a directory holding `model.onnx` and
/// `tokenizer.json`, or the path of an `.onnx` file with the tokenizer next
/// to it. Recognized loader options:
/// - `onnx_file`: file name inside the model directory
/// - `max_length`: truncation length in tokens
/// - `pool_size`: number of sessions
/// - `intra_threads`: ONNX intra-op threads per session
/// - `token_type_ids`: whether the graph takes segment ids
#[derive(Debug, Clone, Default)]
pub struct OnnxLoader;

impl OnnxLoader {
    pub fn new() -> Self {
        Self
    }

    fn resolve_paths(model: &str, onnx_file: Option<&str>) -> Result<(PathBuf, PathBuf)> {
        let path = Path::new(model);

        if path.is_file() {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            return Ok((path.to_path_buf(), dir.join(TOKENIZER_FILE)));
        }

        if path.is_dir() {
            let model_path = path.join(onnx_file.unwrap_or(DEFAULT_ONNX_FILE));
            return Ok((model_path, path.join(TOKENIZER_FILE)));
        }

        Err(AppError::ModelError(format!(
            "Model not found: {} (expected a local ONNX export)",
            model
        )))
    }
}

fn is_cpu_placement(placement: &Placement) -> bool {
    match placement {
        Placement::Auto => true,
        Placement::Single(device) => device.is_cpu(),
        Placement::Layered(map) => map.devices().all(|d| d.is_cpu()),
    }
}

impl EngineLoader for OnnxLoader {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn ScoringEngine>> {
        let kwargs = request.model_kwargs;
        let (model_path, tokenizer_path) =
            Self::resolve_paths(request.model, kwargs.get_str("onnx_file"))?;

        if !is_cpu_placement(request.placement) {
            tracing::warn!(
                placement = ?request.placement,
                "Accelerator placement is not available for ONNX models, running on CPU"
            );
        }

        if let Some(dtype) = kwargs.get_dtype("torch_dtype") {
            if dtype != DType::Float32 {
                tracing::warn!(
                    dtype = %dtype,
                    "ONNX graphs run at their exported precision, ignoring torch_dtype"
                );
            }
        }

        if request.token.is_some() {
            tracing::debug!("Credential not needed for local model files");
        }

        let max_length = kwargs.get_usize("max_length").unwrap_or(DEFAULT_MAX_LENGTH);
        let pool_size = kwargs.get_usize("pool_size").unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });
        let intra_threads = kwargs.get_usize("intra_threads").unwrap_or(1);
        let use_token_type_ids = kwargs.get_bool("token_type_ids").unwrap_or(true);

        let tokenizer = PairTokenizer::load(&tokenizer_path, max_length)?;
        let model =
            CrossEncoderModel::load_pool(&model_path, pool_size, intra_threads, use_token_type_ids)?;

        tracing::info!(
            model = request.model,
            device = %Device::Cpu,
            sessions = model.pool_size(),
            "Cross-encoder ready"
        );

        Ok(Box::new(OnnxEngine::new(model, tokenizer)))
    }
}
