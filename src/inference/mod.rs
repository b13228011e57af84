pub mod engine;
pub mod model;
pub mod onnx;
pub mod tokenize;

pub use engine::{EngineLoader, FnEngine, FnLoader, LoadRequest, ScoringEngine};
pub use model::CrossEncoderModel;
pub use onnx::{OnnxEngine, OnnxLoader};
pub use tokenize::{EncodedBatch, PairTokenizer};
