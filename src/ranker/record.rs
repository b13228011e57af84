//! Export/import of a ranker's configuration as a plain record.
//!
//! The record is `{ "type": ..., "init_parameters": { ... } }`. Secret tokens
//! are never written; precision markers and device maps use the canonical
//! encodings of [`ModelKwargs`].

use crate::device::ComponentDevice;
use crate::error::{AppError, Result};
use crate::ranker::config::{top_k_from_i64, RankerConfig, Token, DEFAULT_EMBEDDING_SEPARATOR};
use crate::ranker::kwargs::ModelKwargs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub const COMPONENT_TYPE: &str = "simrank::ranker::SimilarityRanker";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    #[serde(rename = "type")]
    pub component_type: String,
    pub init_parameters: InitParameters,
}

fn default_separator() -> String {
    DEFAULT_EMBEDDING_SEPARATOR.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitParameters {
    pub model: String,
    #[serde(default)]
    pub device: Value,
    #[serde(default)]
    pub token: Value,
    pub top_k: i64,
    #[serde(default)]
    pub query_prefix: String,
    #[serde(default)]
    pub document_prefix: String,
    #[serde(default)]
    pub meta_fields_to_embed: Option<Vec<String>>,
    #[serde(default = "default_separator")]
    pub embedding_separator: String,
    pub scale_score: bool,
    pub calibration_factor: Option<f64>,
    pub score_threshold: Option<f64>,
    #[serde(default)]
    pub model_kwargs: Value,
}

fn token_to_value(token: Option<&Token>) -> Value {
    match token {
        Some(Token::Flag(flag)) => Value::Bool(*flag),
        Some(Token::Secret(_)) | None => Value::Null,
    }
}

fn token_from_value(value: &Value) -> Result<Option<Token>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(flag) => Ok(Some(Token::Flag(*flag))),
        Value::String(secret) => Ok(Some(Token::Secret(secret.clone()))),
        other => Err(AppError::ConfigError(format!(
            "token must be a boolean, a string or null, got {}",
            other
        ))),
    }
}

impl From<&RankerConfig> for InitParameters {
    fn from(config: &RankerConfig) -> Self {
        Self {
            model: config.model.clone(),
            device: config
                .device
                .as_ref()
                .map_or(Value::Null, ComponentDevice::to_value),
            token: token_to_value(config.token.as_ref()),
            top_k: config.top_k as i64,
            query_prefix: config.query_prefix.clone(),
            document_prefix: config.document_prefix.clone(),
            meta_fields_to_embed: Some(config.meta_fields_to_embed.clone()),
            embedding_separator: config.embedding_separator.clone(),
            scale_score: config.scale_score,
            calibration_factor: config.calibration_factor,
            score_threshold: config.score_threshold,
            model_kwargs: config.model_kwargs.to_value(),
        }
    }
}

impl TryFrom<InitParameters> for RankerConfig {
    type Error = AppError;

    fn try_from(params: InitParameters) -> Result<Self> {
        let device = match &params.device {
            Value::Null => None,
            value => Some(ComponentDevice::from_value(value)?),
        };

        Ok(Self {
            model: params.model,
            device,
            token: token_from_value(&params.token)?,
            top_k: top_k_from_i64(params.top_k)?,
            query_prefix: params.query_prefix,
            document_prefix: params.document_prefix,
            meta_fields_to_embed: params.meta_fields_to_embed.unwrap_or_default(),
            embedding_separator: params.embedding_separator,
            scale_score: params.scale_score,
            calibration_factor: params.calibration_factor,
            score_threshold: params.score_threshold,
            model_kwargs: ModelKwargs::from_value(&params.model_kwargs)?,
        })
    }
}

impl ComponentRecord {
    pub fn from_config(config: &RankerConfig) -> Self {
        Self {
            component_type: COMPONENT_TYPE.to_string(),
            init_parameters: InitParameters::from(config),
        }
    }

    /// Decodes the init parameters, rejecting records of other components.
    pub fn into_config(self) -> Result<RankerConfig> {
        if self.component_type != COMPONENT_TYPE {
            return Err(AppError::ConfigError(format!(
                "Record type '{}' does not match '{}'",
                self.component_type, COMPONENT_TYPE
            )));
        }
        RankerConfig::try_from(self.init_parameters)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!(
                "Failed to read ranker config {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).map_err(|e| {
            AppError::ConfigError(format!(
                "Failed to write ranker config {}: {}",
                path.display(),
                e
            ))
        })
    }
}
