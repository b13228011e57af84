use crate::error::{AppError, Result};
use crate::ranker::pairs::ScoredPair;
use ndarray::{Array2, ArrayViewMut1};
use std::path::Path;
use tokenizers::{EncodeInput, Encoding, PaddingParams, Tokenizer, TruncationParams};

/// Model inputs for one batch of pairs, one row per pair.
#[derive(Debug)]
pub struct EncodedBatch {
    pub input_ids: Array2<i64>,
    pub attention_mask: Array2<i64>,
    pub token_type_ids: Array2<i64>,
}

impl EncodedBatch {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            input_ids: Array2::zeros((rows, cols)),
            attention_mask: Array2::zeros((rows, cols)),
            token_type_ids: Array2::zeros((rows, cols)),
        }
    }

    /// `[rows, sequence_length]`
    pub fn shape(&self) -> [usize; 2] {
        [self.input_ids.nrows(), self.input_ids.ncols()]
    }
}

fn copy_row(mut row: ArrayViewMut1<'_, i64>, values: &[u32]) {
    for (slot, value) in row.iter_mut().zip(values) {
        *slot = i64::from(*value);
    }
}

/// Cross-encoder tokenizer: encodes `(query, document)` as one sequence pair.
pub struct PairTokenizer {
    tokenizer: Tokenizer,
    max_length: usize,
}

impl PairTokenizer {
    /// Loads `tokenizer.json`, truncating pairs to `max_length` tokens and
    /// padding each batch to its longest row.
    pub fn load(tokenizer_path: &Path, max_length: usize) -> Result<Self> {
        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| AppError::TokenizationError(e.to_string()))?;

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| AppError::TokenizationError(e.to_string()))?;
        tokenizer.with_padding(Some(PaddingParams::default()));

        tracing::info!(
            path = %tokenizer_path.display(),
            max_length,
            "Pair tokenizer ready"
        );

        Ok(Self {
            tokenizer,
            max_length,
        })
    }

    pub fn encode(&self, pairs: &[ScoredPair]) -> Result<EncodedBatch> {
        if pairs.is_empty() {
            return Err(AppError::ValidationError(
                "Pair batch cannot be empty".to_string(),
            ));
        }

        let inputs: Vec<EncodeInput> = pairs
            .iter()
            .map(|pair| (pair.query.as_str(), pair.document.as_str()).into())
            .collect();
        let encodings: Vec<Encoding> = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| AppError::TokenizationError(e.to_string()))?;

        // A tokenizer.json with its own padding rules may still exceed max_length.
        let width = encodings
            .iter()
            .map(|encoding| encoding.len())
            .max()
            .unwrap_or(0)
            .min(self.max_length);

        let mut batch = EncodedBatch::zeros(encodings.len(), width);
        for (i, encoding) in encodings.iter().enumerate() {
            copy_row(batch.input_ids.row_mut(i), encoding.get_ids());
            copy_row(batch.attention_mask.row_mut(i), encoding.get_attention_mask());
            copy_row(batch.token_type_ids.row_mut(i), encoding.get_type_ids());
        }

        tracing::trace!(rows = encodings.len(), width, "Encoded pair batch");

        Ok(batch)
    }
}
