//! Cross-validation summaries.

use serde::{Deserialize, Serialize};

use super::CombineError;

/// A metric averaged across cross-validation folds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationSummary {
    /// The metric name.
    pub metric: String,
    /// Metric value per fold, in fold order.
    pub per_fold: Vec<f64>,
    /// Mean across folds.
    pub mean: f64,
    /// Population standard deviation across folds.
    pub std_dev: f64,
}

impl CrossValidationSummary {
    /// Summarizes per-fold metric values.
    pub fn from_folds(metric: impl Into<String>, per_fold: Vec<f64>) -> Result<Self, CombineError> {
        if per_fold.is_empty() {
            return Err(CombineError::NoInputs);
        }
        let n = per_fold.len() as f64;
        let mean = per_fold.iter().sum::<f64>() / n;
        let variance = per_fold.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;

        Ok(Self {
            metric: metric.into(),
            per_fold,
            mean,
            std_dev: variance.sqrt(),
        })
    }
}
