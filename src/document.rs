//! Candidate documents handed to the ranker by an upstream retriever.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A retrieved candidate.
///
/// `content` and `meta` are read by the ranker; `score` is written by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default = "new_document_id")]
    pub id: String,

    #[serde(default)]
    pub content: Option<String>,

    #[serde(default)]
    pub meta: Map<String, Value>,

    #[serde(default)]
    pub score: Option<f64>,
}

fn new_document_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Document {
    /// Creates a document with the given content and a random id.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: new_document_id(),
            content: Some(content.into()),
            meta: Map::new(),
            score: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Creates a document that carries only metadata.
    pub fn empty() -> Self {
        Self {
            id: new_document_id(),
            content: None,
            meta: Map::new(),
            score: None,
        }
    }
}
