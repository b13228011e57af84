//! Cross-encoder similarity ranking.
//!
//! [`SimilarityRanker`] scores `(query, document)` pairs with a cross-encoder
//! and returns the documents ordered by relevance.
//!
//! # Flow of `run`
//! 1. Empty input returns immediately, without touching the engine
//! 2. Per-call overrides are merged into the stored defaults and validated
//! 3. One pair per document: prefixed query, prefixed metadata + content
//! 4. One batched engine call for all pairs
//! 5. Optional `sigmoid(score * calibration_factor)`
//! 6. Scores written onto every document, stable sort descending
//! 7. Threshold filter, then `top_k` truncation

pub mod calibrate;
pub mod config;
pub mod kwargs;
pub mod pairs;
pub mod record;

pub use config::{RankerConfig, RunOptions, Token};
pub use kwargs::{DType, KwargValue, ModelKwargs};
pub use pairs::ScoredPair;
pub use record::{ComponentRecord, COMPONENT_TYPE};

use crate::device::{resolve_device_map, ComponentDevice, DeviceMapSpec, Placement};
use crate::document::Document;
use crate::error::{AppError, Result};
use crate::inference::{EngineLoader, LoadRequest, OnnxLoader, ScoringEngine};
use calibrate::{calibrate, descending_order};
use kwargs::DEVICE_MAP;
use pairs::{build_pairs, PairFormat};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

pub struct SimilarityRanker {
    config: RankerConfig,
    loader: Arc<dyn EngineLoader>,
    engine: Option<Box<dyn ScoringEngine>>,
}

impl fmt::Debug for SimilarityRanker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimilarityRanker")
            .field("config", &self.config)
            .field("warmed_up", &self.is_warmed_up())
            .finish()
    }
}

impl SimilarityRanker {
    /// Validates `config` and builds a ranker that loads its engine through `loader`.
    ///
    /// An explicit device is folded into the `device_map` loader option. When
    /// both are given the device map wins and the device is dropped with a
    /// warning.
    pub fn new(mut config: RankerConfig, loader: Arc<dyn EngineLoader>) -> Result<Self> {
        let device = config.device.take();
        let device_map = config.model_kwargs.take_device_map()?;
        let (device_map, conflict) = resolve_device_map(device, device_map);
        if conflict {
            tracing::warn!(
                "The parameters `device` and `device_map` from `model_kwargs` are both provided. \
                 Ignoring `device` and using `device_map`."
            );
        }
        config.model_kwargs.insert(DEVICE_MAP, device_map);

        config.validate()?;

        Ok(Self {
            config,
            loader,
            engine: None,
        })
    }

    /// Ranker backed by local ONNX exports.
    pub fn onnx(config: RankerConfig) -> Result<Self> {
        Self::new(config, Arc::new(OnnxLoader::new()))
    }

    pub fn config(&self) -> &RankerConfig {
        &self.config
    }

    pub fn is_warmed_up(&self) -> bool {
        self.engine.is_some()
    }

    /// Loads the scoring engine. Calls after the first successful one do nothing.
    pub fn warm_up(&mut self) -> Result<()> {
        if self.engine.is_some() {
            tracing::debug!(model = %self.config.model, "Ranker already warmed up");
            return Ok(());
        }

        let device_map = self
            .config
            .model_kwargs
            .device_map()
            .cloned()
            .unwrap_or_else(|| ComponentDevice::resolve_device(None).to_hf());
        let placement = Placement::resolve(&device_map)?;

        let start = Instant::now();
        let engine = self.loader.load(&LoadRequest {
            model: &self.config.model,
            token: self.config.token.as_ref(),
            placement: &placement,
            model_kwargs: &self.config.model_kwargs,
        })?;

        if let Some(Placement::Layered(map)) = engine.placement() {
            self.config
                .model_kwargs
                .insert(DEVICE_MAP, DeviceMapSpec::Layers(map));
        }

        tracing::info!(
            model = %self.config.model,
            placement = ?placement,
            primary_device = ?placement.primary(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Ranker warmed up"
        );

        self.engine = Some(engine);
        Ok(())
    }

    fn pair_format(&self) -> PairFormat<'_> {
        PairFormat {
            query_prefix: &self.config.query_prefix,
            document_prefix: &self.config.document_prefix,
            meta_fields_to_embed: &self.config.meta_fields_to_embed,
            embedding_separator: &self.config.embedding_separator,
        }
    }

    /// Ranks `documents` by relevance to `query`.
    ///
    /// Every input document gets its `score` set, including the ones dropped
    /// by the threshold or by `top_k`. The returned references point into
    /// `documents`, best first.
    pub fn run<'a>(
        &self,
        query: &str,
        documents: &'a mut [Document],
        options: RunOptions,
    ) -> Result<Vec<&'a Document>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let params = self.config.effective(&options)?;

        let engine = self.engine.as_ref().ok_or_else(|| {
            AppError::NotReady(
                "The component SimilarityRanker wasn't warmed up. Run 'warm_up()' before calling 'run()'."
                    .to_string(),
            )
        })?;

        let pairs = build_pairs(query, documents, &self.pair_format());
        let raw_scores = engine.score_pairs(&pairs)?;
        if raw_scores.len() != documents.len() {
            return Err(AppError::ModelError(format!(
                "Scoring engine returned {} scores for {} documents",
                raw_scores.len(),
                documents.len()
            )));
        }

        let factor = if params.scale_score {
            params.calibration_factor
        } else {
            None
        };
        let scores = calibrate(&raw_scores, factor);

        for (document, score) in documents.iter_mut().zip(&scores) {
            document.score = Some(*score);
        }

        let order = descending_order(&scores);
        let documents: &'a [Document] = documents;
        let ranked: Vec<&'a Document> = order
            .into_iter()
            .filter(|&i| params.score_threshold.map_or(true, |t| scores[i] >= t))
            .take(params.top_k)
            .map(|i| &documents[i])
            .collect();

        tracing::debug!(
            batch_size = documents.len(),
            returned = ranked.len(),
            top_k = params.top_k,
            scale_score = params.scale_score,
            top_score = ranked.first().and_then(|d| d.score),
            "Ranking completed"
        );

        Ok(ranked)
    }

    /// Exports the configuration as a plain record.
    pub fn to_record(&self) -> ComponentRecord {
        ComponentRecord::from_config(&self.config)
    }

    /// Rebuilds a ranker from an exported record. The engine is not loaded.
    pub fn from_record(record: ComponentRecord, loader: Arc<dyn EngineLoader>) -> Result<Self> {
        Self::new(record.into_config()?, loader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceMap};
    use crate::inference::FnLoader;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fixed_scores(scores: Vec<f32>) -> Arc<dyn EngineLoader> {
        Arc::new(FnLoader::new(move |pairs: &[ScoredPair]| {
            Ok(scores.iter().copied().take(pairs.len()).collect())
        }))
    }

    /// Scores a pair by whether its document mentions `needle`.
    fn keyword_scores(needle: &'static str) -> Arc<dyn EngineLoader> {
        Arc::new(FnLoader::new(move |pairs: &[ScoredPair]| {
            Ok(pairs
                .iter()
                .map(|p| if p.document.contains(needle) { 4.0 } else { -4.0 })
                .collect())
        }))
    }

    fn warmed(config: RankerConfig, loader: Arc<dyn EngineLoader>) -> SimilarityRanker {
        let mut ranker = SimilarityRanker::new(config, loader).unwrap();
        ranker.warm_up().unwrap();
        ranker
    }

    fn docs(contents: &[&str]) -> Vec<Document> {
        contents.iter().map(|c| Document::new(*c)).collect()
    }

    #[test]
    fn test_berlin_ranked_above_paris() {
        let ranker = warmed(RankerConfig::default(), keyword_scores("Berlin"));
        let mut documents = docs(&["Paris", "Berlin"]);

        let ranked = ranker
            .run("City in Germany", &mut documents, RunOptions::default())
            .unwrap();

        let contents: Vec<&str> = ranked.iter().map(|d| d.content.as_deref().unwrap()).collect();
        assert_eq!(contents, vec!["Berlin", "Paris"]);
        assert!(ranked[0].score.unwrap() > ranked[1].score.unwrap());
    }

    #[test]
    fn test_raw_logits_kept_when_unscaled() {
        let config = RankerConfig::default().with_scale_score(false, None);
        let ranker = warmed(config, fixed_scores(vec![-10.6859, -8.9874]));
        let mut documents = docs(&["document number 0", "document number 1"]);

        let ranked = ranker
            .run("test", &mut documents, RunOptions::default())
            .unwrap();

        assert!((ranked[0].score.unwrap() + 8.9874).abs() < 1e-4);
        assert!((ranked[1].score.unwrap() + 10.6859).abs() < 1e-4);
        assert_eq!(ranked[0].content.as_deref(), Some("document number 1"));
    }

    #[test]
    fn test_score_threshold_filters() {
        let config = RankerConfig::default()
            .with_scale_score(false, None)
            .with_score_threshold(0.1);
        let ranker = warmed(config, fixed_scores(vec![0.955, 0.001]));
        let mut documents = docs(&["document number 0", "document number 1"]);

        let ranked = ranker
            .run("test", &mut documents, RunOptions::default())
            .unwrap();

        assert_eq!(ranked.len(), 1);
        assert!((ranked[0].score.unwrap() - 0.955).abs() < 1e-4);
    }

    #[test]
    fn test_every_document_scored_before_filtering() {
        let config = RankerConfig::default().with_top_k(1).with_score_threshold(0.9);
        let ranker = warmed(config, fixed_scores(vec![-2.0, 5.0, 0.0]));
        let mut documents = docs(&["a", "b", "c"]);

        let returned = ranker
            .run("q", &mut documents, RunOptions::default())
            .unwrap()
            .len();

        assert_eq!(returned, 1);
        assert!(documents.iter().all(|d| d.score.is_some()));
        assert!((documents[2].score.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_calibration_factor_applied() {
        let config = RankerConfig::default().with_scale_score(true, Some(0.5));
        let ranker = warmed(config, fixed_scores(vec![2.0]));
        let mut documents = docs(&["a"]);

        let ranked = ranker.run("q", &mut documents, RunOptions::default()).unwrap();

        assert!((ranked[0].score.unwrap() - calibrate::sigmoid(1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let ranker = warmed(RankerConfig::default(), fixed_scores(vec![1.0, 3.0, 1.0, 3.0]));
        let mut documents = docs(&["a", "b", "c", "d"]);

        let ranked = ranker.run("q", &mut documents, RunOptions::default()).unwrap();

        let contents: Vec<&str> = ranked.iter().map(|d| d.content.as_deref().unwrap()).collect();
        assert_eq!(contents, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_top_k_override() {
        let ranker = warmed(RankerConfig::default(), fixed_scores(vec![0.1, 0.3, 0.2]));
        let mut documents = docs(&["a", "b", "c"]);

        let ranked = ranker
            .run("q", &mut documents, RunOptions::default().top_k(2))
            .unwrap();

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranker.config().top_k, 10);
    }

    #[test]
    fn test_scale_score_override_false_disables_scaling() {
        let ranker = warmed(RankerConfig::default(), fixed_scores(vec![3.0]));
        let mut documents = docs(&["a"]);

        let ranked = ranker
            .run("q", &mut documents, RunOptions::default().scale_score(false))
            .unwrap();

        assert_eq!(ranked[0].score, Some(3.0));
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let ranker = warmed(
            RankerConfig::default().with_scale_score(false, None),
            fixed_scores(vec![1.0]),
        );
        let mut documents = docs(&["a"]);

        let err = ranker
            .run("q", &mut documents, RunOptions::default().top_k(0))
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));

        let err = ranker
            .run("q", &mut documents, RunOptions::default().scale_score(true))
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn test_empty_input_skips_engine() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader = Arc::new(FnLoader::new(move |pairs: &[ScoredPair]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.0; pairs.len()])
        }));

        let ranker = warmed(RankerConfig::default(), loader);
        let mut empty: Vec<Document> = Vec::new();
        let ranked = ranker.run("q", &mut empty, RunOptions::default()).unwrap();
        assert!(ranked.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut documents = docs(&["a", "b", "c"]);
        ranker.run("q", &mut documents, RunOptions::default()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_before_warm_up_is_not_ready() {
        let ranker =
            SimilarityRanker::new(RankerConfig::default(), fixed_scores(vec![1.0])).unwrap();
        let mut documents = docs(&["document"]);

        let err = ranker
            .run("query", &mut documents, RunOptions::default())
            .unwrap_err();

        assert!(matches!(err, AppError::NotReady(_)));
        assert!(documents[0].score.is_none());
    }

    #[test]
    fn test_warm_up_is_idempotent() {
        let loads = Arc::new(AtomicUsize::new(0));

        struct CountingLoader(Arc<AtomicUsize>);
        impl EngineLoader for CountingLoader {
            fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn ScoringEngine>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                FnLoader::new(|pairs: &[ScoredPair]| Ok(vec![0.0; pairs.len()])).load(request)
            }
        }

        let mut ranker = SimilarityRanker::new(
            RankerConfig::default(),
            Arc::new(CountingLoader(Arc::clone(&loads))),
        )
        .unwrap();
        ranker.warm_up().unwrap();
        ranker.warm_up().unwrap();

        assert!(ranker.is_warmed_up());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pairs_sent_to_engine() {
        let seen: Arc<Mutex<Vec<ScoredPair>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let loader = Arc::new(FnLoader::new(move |pairs: &[ScoredPair]| {
            sink.lock().unwrap().extend_from_slice(pairs);
            Ok(vec![0.0; pairs.len()])
        }));

        let config = RankerConfig::new("model")
            .with_meta_fields(["meta_field"])
            .with_embedding_separator("\n");
        let ranker = warmed(config, loader);
        let mut documents: Vec<Document> = (0..5)
            .map(|i| {
                Document::new(format!("document number {}", i))
                    .with_meta("meta_field", format!("meta_value {}", i))
            })
            .collect();

        ranker.run("test", &mut documents, RunOptions::default()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        for (i, pair) in seen.iter().enumerate() {
            assert_eq!(pair.query, "test");
            assert_eq!(
                pair.document,
                format!("meta_value {}\ndocument number {}", i, i)
            );
        }
    }

    #[test]
    fn test_engine_score_count_mismatch() {
        let ranker = warmed(RankerConfig::default(), fixed_scores(vec![1.0]));
        let mut documents = docs(&["a", "b"]);

        let err = ranker
            .run("q", &mut documents, RunOptions::default())
            .unwrap_err();

        assert!(matches!(err, AppError::ModelError(_)));
    }

    #[test]
    fn test_engine_failure_propagates() {
        let loader = Arc::new(FnLoader::new(|_: &[ScoredPair]| {
            Err(AppError::ModelError("out of memory".to_string()))
        }));
        let ranker = warmed(RankerConfig::default(), loader);
        let mut documents = docs(&["a"]);

        let err = ranker
            .run("q", &mut documents, RunOptions::default())
            .unwrap_err();

        assert_eq!(err.to_string(), "Model inference failed: out of memory");
    }

    #[test]
    fn test_construction_validates() {
        let err = SimilarityRanker::new(
            RankerConfig::default().with_scale_score(true, None),
            fixed_scores(vec![]),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));

        assert!(SimilarityRanker::new(
            RankerConfig::default().with_top_k(0),
            fixed_scores(vec![])
        )
        .is_err());
    }

    #[test]
    fn test_device_folded_into_device_map() {
        let ranker = SimilarityRanker::new(
            RankerConfig::default().with_device(ComponentDevice::from_single(Device::Cuda(0))),
            fixed_scores(vec![]),
        )
        .unwrap();

        assert!(ranker.config().device.is_none());
        assert_eq!(
            ranker.config().model_kwargs.device_map(),
            Some(&DeviceMapSpec::Named("cuda:0".into()))
        );
    }

    #[test]
    fn test_device_map_wins_over_device() {
        let kwargs = ModelKwargs::new().with(DEVICE_MAP, DeviceMapSpec::Named("cpu".into()));
        let ranker = SimilarityRanker::new(
            RankerConfig::new("model")
                .with_device(ComponentDevice::from_single(Device::Cuda(0)))
                .with_model_kwargs(kwargs),
            fixed_scores(vec![]),
        )
        .unwrap();

        assert_eq!(
            ranker.config().model_kwargs.device_map(),
            Some(&DeviceMapSpec::Named("cpu".into()))
        );
    }

    #[test]
    fn test_plain_string_device_map_is_kept() {
        let kwargs = ModelKwargs::new().with(DEVICE_MAP, "cuda:1");
        let ranker = SimilarityRanker::new(
            RankerConfig::new("model").with_model_kwargs(kwargs),
            fixed_scores(vec![]),
        )
        .unwrap();

        assert_eq!(
            ranker.config().model_kwargs.device_map(),
            Some(&DeviceMapSpec::Named("cuda:1".into()))
        );
        assert_eq!(
            ranker.to_record().to_value().unwrap()["init_parameters"]["model_kwargs"]["device_map"],
            json!("cuda:1")
        );
    }

    #[test]
    fn test_empty_device_map_falls_back_to_device() {
        for empty in [json!(""), json!({})] {
            let kwargs = ModelKwargs::from_value(&json!({ "device_map": empty })).unwrap();
            let mut ranker = SimilarityRanker::new(
                RankerConfig::new("model")
                    .with_device(ComponentDevice::from_single(Device::Cuda(0)))
                    .with_model_kwargs(kwargs),
                fixed_scores(vec![]),
            )
            .unwrap();

            assert_eq!(
                ranker.config().model_kwargs.device_map(),
                Some(&DeviceMapSpec::Named("cuda:0".into()))
            );
            assert!(ranker.warm_up().is_ok());
        }
    }

    #[test]
    fn test_device_conflict_is_logged() {
        #[derive(Clone)]
        struct SharedLog(Arc<Mutex<Vec<u8>>>);

        impl std::io::Write for SharedLog {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let log = SharedLog(Arc::new(Mutex::new(Vec::new())));
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(move || writer.clone())
            .finish();

        let build = |device: Option<ComponentDevice>| {
            let mut config = RankerConfig::new("model")
                .with_model_kwargs(ModelKwargs::new().with(DEVICE_MAP, "cpu"));
            config.device = device;
            SimilarityRanker::new(config, fixed_scores(vec![])).unwrap()
        };

        tracing::subscriber::with_default(subscriber, || {
            build(None);
        });
        assert!(log.0.lock().unwrap().is_empty());

        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer({
                let writer = log.clone();
                move || writer.clone()
            })
            .finish();
        let ranker = tracing::subscriber::with_default(subscriber, || {
            build(Some(ComponentDevice::from_single(Device::Cuda(0))))
        });

        let output = String::from_utf8_lossy(&log.0.lock().unwrap()).into_owned();
        assert!(output.contains("WARN"), "{}", output);
        assert!(output.contains("Ignoring `device` and using `device_map`"), "{}", output);
        assert_eq!(
            ranker.config().model_kwargs.device_map(),
            Some(&DeviceMapSpec::Named("cpu".into()))
        );
    }

    #[test]
    fn test_layered_placement_reported_by_engine() {
        struct LayeredEngine;
        impl ScoringEngine for LayeredEngine {
            fn score_pairs(&self, pairs: &[ScoredPair]) -> Result<Vec<f32>> {
                Ok(vec![0.0; pairs.len()])
            }
            fn placement(&self) -> Option<Placement> {
                let mut map = DeviceMap::new();
                map.insert("layer_1", Device::Cuda(1));
                map.insert("classifier", Device::Cpu);
                Some(Placement::Layered(map))
            }
        }
        struct LayeredLoader;
        impl EngineLoader for LayeredLoader {
            fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn ScoringEngine>> {
                assert_eq!(request.model, "model");
                assert!(matches!(request.placement, Placement::Layered(_)));
                Ok(Box::new(LayeredEngine))
            }
        }

        let kwargs = ModelKwargs::from_value(&json!({
            "device_map": { "layer_1": 1, "classifier": "cpu" }
        }))
        .unwrap();
        let mut ranker = SimilarityRanker::new(
            RankerConfig::new("model").with_model_kwargs(kwargs),
            Arc::new(LayeredLoader),
        )
        .unwrap();
        ranker.warm_up().unwrap();

        assert_eq!(
            ranker.to_record().init_parameters.model_kwargs,
            json!({ "device_map": { "layer_1": 1, "classifier": "cpu" } })
        );
    }

    #[test]
    fn test_default_record() {
        let ranker =
            SimilarityRanker::new(RankerConfig::default(), fixed_scores(vec![])).unwrap();

        assert_eq!(
            ranker.to_record().to_value().unwrap(),
            json!({
                "type": "simrank::ranker::SimilarityRanker",
                "init_parameters": {
                    "model": "cross-encoder/ms-marco-MiniLM-L-6-v2",
                    "device": null,
                    "token": null,
                    "top_k": 10,
                    "query_prefix": "",
                    "document_prefix": "",
                    "meta_fields_to_embed": [],
                    "embedding_separator": "\n",
                    "scale_score": true,
                    "calibration_factor": 1.0,
                    "score_threshold": null,
                    "model_kwargs": { "device_map": "cpu" }
                }
            })
        );
    }

    #[test]
    fn test_record_round_trip() {
        let config = RankerConfig::new("my_model")
            .with_device(ComponentDevice::from_single(Device::Cuda(0)))
            .with_token(Token::Secret("my_token".into()))
            .with_top_k(5)
            .with_prefixes("query_instruction: ", "document_instruction: ")
            .with_meta_fields(["title"])
            .with_scale_score(false, None)
            .with_score_threshold(0.01)
            .with_model_kwargs(
                ModelKwargs::new()
                    .with("torch_dtype", DType::Float16)
                    .with("load_in_4bit", true)
                    .with("bnb_4bit_quant_type", "nf4"),
            );
        let original = SimilarityRanker::new(config, fixed_scores(vec![])).unwrap();
        let exported = original.to_record();

        let restored =
            SimilarityRanker::from_record(exported.clone(), fixed_scores(vec![])).unwrap();

        assert_eq!(restored.to_record(), exported);
        assert!(restored.config().token.is_none());
        assert_eq!(
            restored.config().model_kwargs.get_dtype("torch_dtype"),
            Some(DType::Float16)
        );
    }
}
