use std::cmp::Ordering;

/// Sigmoid activation: 1 / (1 + e^-x)
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Maps raw engine scores to ranking scores.
///
/// With `calibration_factor` set the score is `sigmoid(raw * factor)`,
/// otherwise the raw value is kept.
pub fn calibrate(raw_scores: &[f32], calibration_factor: Option<f64>) -> Vec<f64> {
    raw_scores
        .iter()
        .map(|&raw| {
            let raw = f64::from(raw);
            match calibration_factor {
                Some(factor) => sigmoid(raw * factor),
                None => raw,
            }
        })
        .collect()
}

/// NaN ranks below every real score.
fn sort_key(score: f64) -> f64 {
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        score
    }
}

/// Indices of `scores` ordered by score descending. Ties keep input order.
pub fn descending_order(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    // sort_by is stable
    order.sort_by(|&a, &b| compare_desc(scores[a], scores[b]));
    order
}

fn compare_desc(a: f64, b: f64) -> Ordering {
    sort_key(b).total_cmp(&sort_key(a))
}
