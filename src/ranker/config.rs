use crate::device::ComponentDevice;
use crate::error::{AppError, Result};
use crate::ranker::kwargs::ModelKwargs;
use std::fmt;

pub const DEFAULT_MODEL: &str = "cross-encoder/ms-marco-MiniLM-L-6-v2";
pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_EMBEDDING_SEPARATOR: &str = "\n";
pub const DEFAULT_CALIBRATION_FACTOR: f64 = 1.0;

/// Credential used by the engine loader for private models.
#[derive(Clone, PartialEq, Eq)]
pub enum Token {
    /// `true` means "use the locally stored credential".
    Flag(bool),
    Secret(String),
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Flag(flag) => f.debug_tuple("Flag").field(flag).finish(),
            Token::Secret(_) => f.write_str("Secret(***)"),
        }
    }
}

/// Ranking parameters and engine loader options of a [`SimilarityRanker`].
///
/// [`SimilarityRanker`]: crate::ranker::SimilarityRanker
#[derive(Debug, Clone, PartialEq)]
pub struct RankerConfig {
    /// Model identifier resolved by the engine loader.
    pub model: String,
    pub device: Option<ComponentDevice>,
    pub token: Option<Token>,
    /// Maximum number of documents returned per call.
    pub top_k: usize,
    /// Instruction prepended to the query.
    pub query_prefix: String,
    /// Instruction prepended to every fused document text.
    pub document_prefix: String,
    /// Metadata fields joined in front of the content, in this order.
    pub meta_fields_to_embed: Vec<String>,
    pub embedding_separator: String,
    /// Squash raw scores with `sigmoid(score * calibration_factor)`.
    pub scale_score: bool,
    pub calibration_factor: Option<f64>,
    /// Minimum score a returned document must reach.
    pub score_threshold: Option<f64>,
    pub model_kwargs: ModelKwargs,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            device: None,
            token: None,
            top_k: DEFAULT_TOP_K,
            query_prefix: String::new(),
            document_prefix: String::new(),
            meta_fields_to_embed: Vec::new(),
            embedding_separator: DEFAULT_EMBEDDING_SEPARATOR.to_string(),
            scale_score: true,
            calibration_factor: Some(DEFAULT_CALIBRATION_FACTOR),
            score_threshold: None,
            model_kwargs: ModelKwargs::new(),
        }
    }
}

impl RankerConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device: ComponentDevice) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_prefixes(
        mut self,
        query_prefix: impl Into<String>,
        document_prefix: impl Into<String>,
    ) -> Self {
        self.query_prefix = query_prefix.into();
        self.document_prefix = document_prefix.into();
        self
    }

    pub fn with_meta_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta_fields_to_embed = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_embedding_separator(mut self, separator: impl Into<String>) -> Self {
        self.embedding_separator = separator.into();
        self
    }

    pub fn with_scale_score(mut self, scale_score: bool, calibration_factor: Option<f64>) -> Self {
        self.scale_score = scale_score;
        self.calibration_factor = calibration_factor;
        self
    }

    pub fn with_score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    pub fn with_model_kwargs(mut self, model_kwargs: ModelKwargs) -> Self {
        self.model_kwargs = model_kwargs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_params(self.top_k, self.scale_score, self.calibration_factor)
    }

    /// Applies per-call overrides to the stored defaults and validates the result.
    pub(crate) fn effective(&self, options: &RunOptions) -> Result<EffectiveParams> {
        let params = EffectiveParams {
            top_k: options.top_k.unwrap_or(self.top_k),
            scale_score: options.scale_score.unwrap_or(self.scale_score),
            calibration_factor: options.calibration_factor.or(self.calibration_factor),
            score_threshold: options.score_threshold.or(self.score_threshold),
        };
        validate_params(params.top_k, params.scale_score, params.calibration_factor)?;
        Ok(params)
    }
}

fn validate_params(top_k: usize, scale_score: bool, calibration_factor: Option<f64>) -> Result<()> {
    if scale_score && calibration_factor.is_none() {
        return Err(AppError::ConfigError(
            "scale_score is true so calibration_factor must be provided, but got None".to_string(),
        ));
    }
    if top_k == 0 {
        return Err(AppError::ConfigError(format!(
            "top_k must be > 0, but got {}",
            top_k
        )));
    }
    Ok(())
}

/// Converts a signed `top_k` from an external source.
pub fn top_k_from_i64(top_k: i64) -> Result<usize> {
    usize::try_from(top_k)
        .ok()
        .filter(|k| *k > 0)
        .ok_or_else(|| AppError::ConfigError(format!("top_k must be > 0, but got {}", top_k)))
}

/// Per-call overrides. A provided value replaces the stored default for that call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunOptions {
    pub top_k: Option<usize>,
    pub scale_score: Option<bool>,
    pub calibration_factor: Option<f64>,
    pub score_threshold: Option<f64>,
}

impl RunOptions {
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn scale_score(mut self, scale_score: bool) -> Self {
        self.scale_score = Some(scale_score);
        self
    }

    pub fn calibration_factor(mut self, factor: f64) -> Self {
        self.calibration_factor = Some(factor);
        self
    }

    pub fn score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = Some(threshold);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct EffectiveParams {
    pub top_k: usize,
    pub scale_score: bool,
    pub calibration_factor: Option<f64>,
    pub score_threshold: Option<f64>,
}
