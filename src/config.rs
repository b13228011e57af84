use crate::device::ComponentDevice;
use crate::error::Result;
use crate::ranker::config::{
    top_k_from_i64, RankerConfig, Token, DEFAULT_CALIBRATION_FACTOR, DEFAULT_EMBEDDING_SEPARATOR,
    DEFAULT_MODEL, DEFAULT_TOP_K,
};
use crate::ranker::kwargs::ModelKwargs;
use crate::ranker::record::ComponentRecord;
use std::env;
use std::path::PathBuf;

/// Operating mode for the ranking server.
/// Controls pool_size, permits, and intra_threads settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// Optimized for single requests with low latency.
    /// pool_size=1, permits=1, intra_threads=8
    Single,
    /// Optimized for concurrent requests with high throughput.
    /// pool_size=10, permits=6, intra_threads=2
    Concurrent,
    /// Use individual environment variable settings.
    Custom,
}

impl OperatingMode {
    pub fn from_env() -> Self {
        match env::var("SIMRANK_MODE")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "single" | "low-latency" | "single-request" => Self::Single,
            "concurrent" | "high-throughput" | "multi" => Self::Concurrent,
            _ => Self::Custom,
        }
    }
}

pub struct Config {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
    /// Maximum documents per rank request.
    pub max_documents: usize,
    /// Exported ranker record. When set, it replaces every ranking setting below.
    pub ranker_config_path: Option<PathBuf>,
    /// Model identifier: a local ONNX export directory or `.onnx` file.
    pub model: String,
    pub device: Option<ComponentDevice>,
    pub token: Option<Token>,
    pub top_k: usize,
    pub scale_score: bool,
    pub calibration_factor: Option<f64>,
    pub score_threshold: Option<f64>,
    pub meta_fields_to_embed: Vec<String>,
    pub embedding_separator: String,
    pub query_prefix: String,
    pub document_prefix: String,
    pub max_sequence_length: usize,
    /// Optional override for session pool size. If None, uses available cores.
    pub pool_size: Option<usize>,
    /// Number of threads per ONNX session for intra-op parallelism.
    /// Formula: permits × intra_threads ≤ physical_cores
    pub intra_threads: usize,
    /// Optional override for semaphore permits. If None, auto-calculated as:
    /// cores / intra_threads (ensures no CPU oversubscription)
    pub permits: Option<usize>,
}

fn optional_f64(name: &str) -> anyhow::Result<Option<f64>> {
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => Ok(Some(raw.trim().parse()?)),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// The `SIMRANK_MODE` environment variable controls preset configurations:
    /// - `single` / `low-latency`: Optimized for single requests (pool=1, permits=1, intra_threads=8)
    /// - `concurrent` / `high-throughput`: Optimized for concurrent requests (pool=10, permits=6, intra_threads=2)
    /// - Unset or other: Uses individual env vars or defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let mode = OperatingMode::from_env();

        let (pool_size, permits, intra_threads) = match mode {
            OperatingMode::Single => (Some(1), Some(1), 8),
            OperatingMode::Concurrent => (Some(10), Some(6), 2),
            OperatingMode::Custom => {
                let pool = env::var("POOL_SIZE").ok().and_then(|s| s.parse().ok());
                let perm = env::var("PERMITS").ok().and_then(|s| s.parse().ok());
                let threads = env::var("INTRA_THREADS")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()?;
                (pool, perm, threads)
            }
        };

        let top_k: i64 = env::var("TOP_K")
            .unwrap_or_else(|_| DEFAULT_TOP_K.to_string())
            .parse()?;

        let scale_score = env::var("SCALE_SCORE")
            .unwrap_or_else(|_| "true".to_string())
            .parse()?;
        let calibration_factor = match env::var("CALIBRATION_FACTOR") {
            Ok(raw) if raw.trim().eq_ignore_ascii_case("none") => None,
            _ => Some(optional_f64("CALIBRATION_FACTOR")?.unwrap_or(DEFAULT_CALIBRATION_FACTOR)),
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()?,
            shutdown_timeout_secs: env::var("SHUTDOWN_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            max_documents: env::var("MAX_DOCUMENTS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,
            ranker_config_path: env::var("RANKER_CONFIG_PATH").ok().map(PathBuf::from),
            model: env::var("MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            device: env::var("DEVICE")
                .ok()
                .map(|raw| raw.parse().map(ComponentDevice::from_single))
                .transpose()?,
            token: env::var("HF_TOKEN").ok().map(Token::Secret),
            top_k: top_k_from_i64(top_k)?,
            scale_score,
            calibration_factor,
            score_threshold: optional_f64("SCORE_THRESHOLD")?,
            meta_fields_to_embed: env::var("META_FIELDS_TO_EMBED")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            embedding_separator: env::var("EMBEDDING_SEPARATOR")
                .unwrap_or_else(|_| DEFAULT_EMBEDDING_SEPARATOR.to_string()),
            query_prefix: env::var("QUERY_PREFIX").unwrap_or_default(),
            document_prefix: env::var("DOCUMENT_PREFIX").unwrap_or_default(),
            max_sequence_length: env::var("MAX_SEQ_LENGTH")
                .unwrap_or_else(|_| "512".to_string())
                .parse()?,
            pool_size,
            intra_threads,
            permits,
        })
    }

    /// Returns the operating mode based on current configuration.
    pub fn mode(&self) -> OperatingMode {
        OperatingMode::from_env()
    }

    /// Ranker settings described by this configuration.
    ///
    /// A record at `ranker_config_path` wins over the individual variables.
    pub fn ranker_config(&self) -> Result<RankerConfig> {
        if let Some(path) = &self.ranker_config_path {
            tracing::info!(path = %path.display(), "Loading ranker record");
            return ComponentRecord::load(path)?.into_config();
        }

        let mut model_kwargs = ModelKwargs::new()
            .with("max_length", self.max_sequence_length as i64)
            .with("intra_threads", self.intra_threads as i64);
        if let Some(pool_size) = self.pool_size {
            model_kwargs.insert("pool_size", pool_size as i64);
        }

        Ok(RankerConfig {
            model: self.model.clone(),
            device: self.device.clone(),
            token: self.token.clone(),
            top_k: self.top_k,
            query_prefix: self.query_prefix.clone(),
            document_prefix: self.document_prefix.clone(),
            meta_fields_to_embed: self.meta_fields_to_embed.clone(),
            embedding_separator: self.embedding_separator.clone(),
            scale_score: self.scale_score,
            calibration_factor: self.calibration_factor,
            score_threshold: self.score_threshold,
            model_kwargs,
        })
    }

    /// Concurrent rank requests allowed through the semaphore.
    pub fn effective_permits(&self) -> usize {
        self.permits.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            (cores / self.intra_threads.max(1)).max(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::ranker::record::ComponentRecord;
    use serial_test::serial;
    use tempfile::tempdir;

    const VARS: &[&str] = &[
        "SIMRANK_MODE",
        "TOP_K",
        "SCALE_SCORE",
        "CALIBRATION_FACTOR",
        "SCORE_THRESHOLD",
        "META_FIELDS_TO_EMBED",
        "DEVICE",
        "HF_TOKEN",
        "RANKER_CONFIG_PATH",
        "POOL_SIZE",
        "PERMITS",
        "INTRA_THREADS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_from_env() {
        clear_env();
        let config = Config::from_env().unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.top_k, 10);
        assert!(config.scale_score);
        assert_eq!(config.calibration_factor, Some(1.0));
        assert!(config.score_threshold.is_none());
        assert_eq!(config.mode(), OperatingMode::Custom);

        let ranker = config.ranker_config().unwrap();
        assert_eq!(ranker.model_kwargs.get_usize("max_length"), Some(512));
        assert!(ranker.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_ranking_settings_from_env() {
        clear_env();
        env::set_var("TOP_K", "3");
        env::set_var("SCALE_SCORE", "false");
        env::set_var("CALIBRATION_FACTOR", "none");
        env::set_var("SCORE_THRESHOLD", "0.25");
        env::set_var("META_FIELDS_TO_EMBED", "title, year");
        env::set_var("DEVICE", "cuda:1");

        let config = Config::from_env().unwrap();
        clear_env();

        assert_eq!(config.top_k, 3);
        assert!(!config.scale_score);
        assert!(config.calibration_factor.is_none());
        assert_eq!(config.score_threshold, Some(0.25));
        assert_eq!(config.meta_fields_to_embed, vec!["title", "year"]);
        assert_eq!(config.device, Some(ComponentDevice::from_single(Device::Cuda(1))));
    }

    #[test]
    #[serial]
    fn test_invalid_top_k_rejected() {
        clear_env();
        env::set_var("TOP_K", "0");
        let result = Config::from_env();
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_mode_presets() {
        clear_env();
        env::set_var("SIMRANK_MODE", "concurrent");
        let config = Config::from_env().unwrap();
        clear_env();

        assert_eq!(config.pool_size, Some(10));
        assert_eq!(config.effective_permits(), 6);
        assert_eq!(config.intra_threads, 2);
    }

    #[test]
    #[serial]
    fn test_record_file_wins() {
        clear_env();
        let dir = tempdir().unwrap();
        let path = dir.path().join("ranker.json");
        ComponentRecord::from_config(&RankerConfig::new("from-record").with_top_k(4))
            .save(&path)
            .unwrap();

        env::set_var("RANKER_CONFIG_PATH", &path);
        env::set_var("TOP_K", "9");
        let config = Config::from_env().unwrap();
        clear_env();

        let ranker = config.ranker_config().unwrap();
        assert_eq!(ranker.model, "from-record");
        assert_eq!(ranker.top_k, 4);
    }
}
