//! Query/document pair construction.

use crate::document::Document;
use serde_json::Value;

/// One cross-encoder input: the prefixed query and the prefixed fused document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredPair {
    pub query: String,
    pub document: String,
}

impl ScoredPair {
    pub fn new(query: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            document: document.into(),
        }
    }
}

/// Settings that shape the pair text.
#[derive(Debug, Clone, Copy)]
pub struct PairFormat<'a> {
    pub query_prefix: &'a str,
    pub document_prefix: &'a str,
    pub meta_fields_to_embed: &'a [String],
    pub embedding_separator: &'a str,
}

/// Metadata values that count as set: not null, false, zero, or empty.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn meta_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Joins the configured metadata values and the content with the separator.
///
/// Strings are used as-is; other values are written as JSON text, so `true`
/// becomes `true` and a list becomes `["a","b"]`.
pub fn fuse_document_text(
    document: &Document,
    meta_fields_to_embed: &[String],
    separator: &str,
) -> String {
    let mut parts: Vec<String> = meta_fields_to_embed
        .iter()
        .filter_map(|key| document.meta.get(key))
        .filter(|value| is_truthy(value))
        .map(meta_to_string)
        .collect();
    parts.push(document.content.clone().unwrap_or_default());
    parts.join(separator)
}

/// Builds one pair per document, in document order.
pub fn build_pairs(query: &str, documents: &[Document], format: &PairFormat<'_>) -> Vec<ScoredPair> {
    let query = format!("{}{}", format.query_prefix, query);
    documents
        .iter()
        .map(|document| {
            let fused = fuse_document_text(
                document,
                format.meta_fields_to_embed,
                format.embedding_separator,
            );
            ScoredPair::new(query.clone(), format!("{}{}", format.document_prefix, fused))
        })
        .collect()
}
