use crate::error::{AppError, Result};
use crate::inference::tokenize::EncodedBatch;
use crossbeam::queue::ArrayQueue;
use ndarray::Array2;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use std::cell::UnsafeCell;
use std::fmt::Display;
use std::path::Path;

fn model_error(err: impl Display) -> AppError {
    AppError::ModelError(err.to_string())
}

fn to_tensor(shape: [usize; 2], values: &Array2<i64>) -> Result<Tensor<i64>> {
    let data: Vec<i64> = values.iter().copied().collect();
    Tensor::from_array((shape, data)).map_err(model_error)
}

/// Cross-encoder sessions shared by concurrent scorers.
///
/// `Session::run` takes `&mut self`, so every session sits in an
/// `UnsafeCell` and is reached only through a [`Lease`] on its index.
/// The lock-free queue never hands the same index to two leases.
pub struct CrossEncoderModel {
    sessions: Vec<UnsafeCell<Session>>,
    idle: ArrayQueue<usize>,
    use_token_type_ids: bool,
}

/// Exclusive use of one pooled session; the index goes back on drop.
struct Lease<'a> {
    model: &'a CrossEncoderModel,
    index: usize,
}

impl Lease<'_> {
    #[allow(clippy::mut_from_ref)]
    fn session(&self) -> &mut Session {
        // SAFETY: the index was popped from `idle` and is pushed back only
        // when this lease drops.
        unsafe { &mut *self.model.sessions[self.index].get() }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        // Capacity equals the session count and this index is out, so push succeeds.
        let _ = self.model.idle.push(self.index);
    }
}

impl CrossEncoderModel {
    /// Commits `pool_size` sessions from one read of `model_path`.
    ///
    /// `intra_threads` is per session; the service keeps
    /// `permits × intra_threads` within the core count.
    pub fn load_pool(
        model_path: &Path,
        pool_size: usize,
        intra_threads: usize,
        use_token_type_ids: bool,
    ) -> Result<Self> {
        let model_bytes = std::fs::read(model_path)
            .map_err(|e| AppError::ModelError(format!("Failed to read model file: {}", e)))?;

        let pool_size = pool_size.max(1);
        let idle = ArrayQueue::new(pool_size);
        let sessions = (0..pool_size)
            .map(|index| {
                let session = Session::builder()
                    .map_err(model_error)?
                    .with_optimization_level(GraphOptimizationLevel::Level3)
                    .map_err(model_error)?
                    .with_intra_threads(intra_threads)
                    .map_err(model_error)?
                    .commit_from_memory(&model_bytes)
                    .map_err(model_error)?;
                idle.push(index)
                    .map_err(|_| AppError::ModelError("Session pool overflow".into()))?;
                Ok(UnsafeCell::new(session))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            path = %model_path.display(),
            pool_size,
            intra_threads,
            use_token_type_ids,
            "Cross-encoder sessions ready"
        );

        Ok(Self {
            sessions,
            idle,
            use_token_type_ids,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.sessions.len()
    }

    fn lease(&self) -> Result<Lease<'_>> {
        let index = self
            .idle
            .pop()
            .ok_or_else(|| AppError::ResourceError("All model sessions are busy".into()))?;
        Ok(Lease { model: self, index })
    }

    /// One forward pass; returns the first logit of every row.
    pub fn score(&self, batch: &EncodedBatch) -> Result<Vec<f32>> {
        let shape = batch.shape();
        let input_ids = to_tensor(shape, &batch.input_ids)?;
        let attention_mask = to_tensor(shape, &batch.attention_mask)?;

        let lease = self.lease()?;
        let outputs = if self.use_token_type_ids {
            let token_type_ids = to_tensor(shape, &batch.token_type_ids)?;
            lease.session().run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ])
        } else {
            // RoBERTa-family exports have no segment input
            lease.session().run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
            ])
        }
        .map_err(model_error)?;

        let logits = outputs
            .get("logits")
            .ok_or_else(|| AppError::ModelError("No 'logits' output found".to_string()))?;
        let (dims, data) = logits.try_extract_tensor::<f32>().map_err(model_error)?;

        // [rows, labels] for classification heads, [rows] for squeezed exports
        let labels = if dims.len() >= 2 {
            (dims[1] as usize).max(1)
        } else {
            1
        };
        first_logits(data, shape[0], labels)
    }
}

fn first_logits(data: &[f32], rows: usize, labels: usize) -> Result<Vec<f32>> {
    if data.len() < rows * labels {
        return Err(AppError::ModelError(format!(
            "Expected {} logits, model returned {}",
            rows * labels,
            data.len()
        )));
    }

    Ok(data.iter().step_by(labels).take(rows).copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_logits_takes_label_zero() {
        let data = [0.5, -0.5, 1.5, -1.5, 2.5, -2.5];
        assert_eq!(first_logits(&data, 3, 2).unwrap(), vec![0.5, 1.5, 2.5]);
    }

    #[test]
    fn test_first_logits_single_label() {
        let data = [-10.6859, -8.9874];
        assert_eq!(first_logits(&data, 2, 1).unwrap(), vec![-10.6859, -8.9874]);
    }

    #[test]
    fn test_first_logits_short_output_is_error() {
        let data = [1.0, 2.0, 3.0];
        assert!(matches!(
            first_logits(&data, 2, 2),
            Err(AppError::ModelError(_))
        ));
    }
}

// SAFETY: sessions are only touched through a Lease, which the idle queue
// makes exclusive per index.
unsafe impl Send for CrossEncoderModel {}
unsafe impl Sync for CrossEncoderModel {}
