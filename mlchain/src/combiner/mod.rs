//! Local combination of remote results.
//!
//! Combine stages never call the platform to create anything. They fetch the
//! payloads of their inputs (or reuse artifacts of upstream combine stages)
//! and compute:
//! - ensembles, the ordered list of member models
//! - row-wise votes over member predictions
//! - partition stitching in row order
//! - cross-validation metric summaries
//!
//! Prediction payloads look like `{"predictions": [{"output": .., "confidence": ..}]}`
//! and evaluation payloads like `{"metrics": {"accuracy": 0.9}}`.

mod cv;
mod stitch;
mod vote;

pub use cv::CrossValidationSummary;
pub use stitch::stitch;
pub use vote::{vote, CombineMethod, PredictionValue, RowPrediction};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{CombineOp, RemoteId};
use crate::errors::{ErrorKind, PartitionMismatchError, StageError};

/// Errors raised while combining inputs.
#[derive(Debug, Error)]
pub enum CombineError {
    /// The stage had nothing to combine.
    #[error("nothing to combine")]
    NoInputs,

    /// The number of inputs does not match the stage's parameters.
    #[error("expected {expected} inputs, got {actual}")]
    InputCount {
        /// Inputs expected.
        expected: usize,
        /// Inputs received.
        actual: usize,
    },

    /// Ensemble members predicted different numbers of rows.
    #[error("member {member} predicted {actual} rows, expected {expected}")]
    RowCountMismatch {
        /// Member index.
        member: usize,
        /// Rows predicted by the first member.
        expected: usize,
        /// Rows predicted by this member.
        actual: usize,
    },

    /// A partition's output does not cover its row range.
    #[error(transparent)]
    PartitionMismatch(#[from] PartitionMismatchError),

    /// A fetched payload did not have the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// An evaluation payload lacks the requested metric.
    #[error("fold {fold} evaluation has no numeric metric '{metric}'")]
    MissingMetric {
        /// Fold index.
        fold: usize,
        /// Metric name.
        metric: String,
    },
}

impl From<CombineError> for StageError {
    fn from(err: CombineError) -> Self {
        match err {
            CombineError::PartitionMismatch(mismatch) => mismatch.into(),
            other => Self::new(ErrorKind::InvalidPayload, other.to_string()),
        }
    }
}

/// The result of a combine stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "artifact", rename_all = "snake_case")]
pub enum CombinedArtifact {
    /// An ensemble of member models.
    Ensemble {
        /// Member model ids, in member order.
        members: Vec<RemoteId>,
    },
    /// Predictions, one per test row.
    Predictions {
        /// Rows in test-data order.
        rows: Vec<RowPrediction>,
    },
    /// A cross-validation summary.
    CrossValidation(CrossValidationSummary),
}

/// One input of a combine stage.
#[derive(Debug, Clone)]
pub enum CombineInput {
    /// A remote resource and, when the operation needs it, its fetched payload.
    Remote {
        /// The resource id.
        remote_id: RemoteId,
        /// The fetched payload.
        payload: Option<serde_json::Value>,
    },
    /// The artifact of an upstream combine stage.
    Local(CombinedArtifact),
}

/// Returns true if `op` reads the payloads of its remote inputs.
#[must_use]
pub fn needs_payloads(op: &CombineOp) -> bool {
    !matches!(op, CombineOp::Ensemble)
}

/// Runs a combine operation over its inputs, given in input order.
pub fn combine(op: &CombineOp, inputs: Vec<CombineInput>) -> Result<CombinedArtifact, CombineError> {
    if inputs.is_empty() {
        return Err(CombineError::NoInputs);
    }

    match op {
        CombineOp::Ensemble => {
            let members = inputs
                .into_iter()
                .map(|input| match input {
                    CombineInput::Remote { remote_id, .. } => Ok(remote_id),
                    CombineInput::Local(_) => Err(CombineError::InvalidPayload(
                        "ensemble members must be remote models".to_string(),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CombinedArtifact::Ensemble { members })
        }
        CombineOp::Vote { method } => {
            let members = inputs
                .into_iter()
                .map(input_rows)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CombinedArtifact::Predictions {
                rows: vote(&members, *method)?,
            })
        }
        CombineOp::Stitch { ranges } => {
            let parts = inputs
                .into_iter()
                .map(input_rows)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CombinedArtifact::Predictions {
                rows: stitch(parts, ranges)?,
            })
        }
        CombineOp::CrossValidation { metric } => {
            let per_fold = inputs
                .iter()
                .enumerate()
                .map(|(fold, input)| match input {
                    CombineInput::Remote {
                        payload: Some(payload),
                        ..
                    } => parse_metric(payload, metric, fold),
                    _ => Err(CombineError::MissingMetric {
                        fold,
                        metric: metric.clone(),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CombinedArtifact::CrossValidation(CrossValidationSummary::from_folds(
                metric.clone(),
                per_fold,
            )?))
        }
    }
}

fn input_rows(input: CombineInput) -> Result<Vec<RowPrediction>, CombineError> {
    match input {
        CombineInput::Remote {
            payload: Some(payload),
            ..
        } => parse_predictions(&payload),
        CombineInput::Remote {
            remote_id,
            payload: None,
        } => Err(CombineError::InvalidPayload(format!(
            "no predictions fetched for {remote_id}"
        ))),
        CombineInput::Local(CombinedArtifact::Predictions { rows }) => Ok(rows),
        CombineInput::Local(_) => Err(CombineError::InvalidPayload(
            "upstream combine stage did not produce predictions".to_string(),
        )),
    }
}

/// Parses a prediction payload.
pub fn parse_predictions(payload: &serde_json::Value) -> Result<Vec<RowPrediction>, CombineError> {
    let predictions = payload
        .get("predictions")
        .ok_or_else(|| CombineError::InvalidPayload("missing 'predictions'".to_string()))?;
    serde_json::from_value(predictions.clone())
        .map_err(|e| CombineError::InvalidPayload(format!("malformed predictions: {e}")))
}

/// Reads one numeric metric from an evaluation payload.
pub fn parse_metric(payload: &serde_json::Value, metric: &str, fold: usize) -> Result<f64, CombineError> {
    payload
        .get("metrics")
        .and_then(|metrics| metrics.get(metric))
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| CombineError::MissingMetric {
            fold,
            metric: metric.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn remote(id: &str, payload: Option<serde_json::Value>) -> CombineInput {
        CombineInput::Remote {
            remote_id: RemoteId::new(id),
            payload,
        }
    }

    #[test]
    fn test_ensemble_keeps_member_order() {
        let artifact = combine(
            &CombineOp::Ensemble,
            vec![remote("model/b", None), remote("model/a", None)],
        )
        .unwrap();
        assert_eq!(
            artifact,
            CombinedArtifact::Ensemble {
                members: vec![RemoteId::new("model/b"), RemoteId::new("model/a")]
            }
        );
    }

    #[test]
    fn test_vote_over_payloads() {
        let payload = |label: &str| json!({"predictions": [{"output": label, "confidence": 0.5}]});
        let artifact = combine(
            &CombineOp::Vote {
                method: CombineMethod::Plurality,
            },
            vec![
                remote("batchprediction/1", Some(payload("cat"))),
                remote("batchprediction/2", Some(payload("dog"))),
                remote("batchprediction/3", Some(payload("cat"))),
            ],
        )
        .unwrap();

        let CombinedArtifact::Predictions { rows } = artifact else {
            panic!("expected predictions");
        };
        assert_eq!(rows[0].output, PredictionValue::Categorical("cat".to_string()));
    }

    #[test]
    fn test_stitch_over_local_votes() {
        let local = |labels: &[&str]| {
            CombineInput::Local(CombinedArtifact::Predictions {
                rows: labels.iter().map(|l| RowPrediction::categorical(*l, None)).collect(),
            })
        };
        let artifact = combine(
            &CombineOp::Stitch {
                ranges: vec![(0, 2), (2, 3)],
            },
            vec![local(&["a", "b"]), local(&["c"])],
        )
        .unwrap();

        let CombinedArtifact::Predictions { rows } = artifact else {
            panic!("expected predictions");
        };
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].output, PredictionValue::Categorical("c".to_string()));
    }

    #[test]
    fn test_cross_validation_summary() {
        let eval = |value: f64| Some(json!({"metrics": {"accuracy": value, "recall": 0.1}}));
        let artifact = combine(
            &CombineOp::CrossValidation {
                metric: "accuracy".to_string(),
            },
            vec![remote("evaluation/1", eval(0.5)), remote("evaluation/2", eval(1.0))],
        )
        .unwrap();

        let CombinedArtifact::CrossValidation(summary) = artifact else {
            panic!("expected a summary");
        };
        assert_eq!(summary.per_fold, vec![0.5, 1.0]);
        assert!((summary.mean - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_missing_metric() {
        let err = combine(
            &CombineOp::CrossValidation {
                metric: "auc".to_string(),
            },
            vec![remote("evaluation/1", Some(json!({"metrics": {"accuracy": 0.5}})))],
        )
        .unwrap_err();
        assert!(matches!(err, CombineError::MissingMetric { fold: 0, .. }));

        let stage_error: StageError = err.into();
        assert_eq!(stage_error.kind, ErrorKind::InvalidPayload);
    }

    #[test]
    fn test_partition_mismatch_maps_to_its_kind() {
        let err: StageError = CombineError::from(PartitionMismatchError::new(0, 10, 9)).into();
        assert_eq!(err.kind, ErrorKind::PartitionMismatch);
    }

    #[test]
    fn test_bad_prediction_payload() {
        assert!(matches!(
            parse_predictions(&json!({"rows": []})),
            Err(CombineError::InvalidPayload(_))
        ));
        assert!(matches!(
            parse_predictions(&json!({"predictions": [{"confidence": 1.0}]})),
            Err(CombineError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_needs_payloads() {
        assert!(!needs_payloads(&CombineOp::Ensemble));
        assert!(needs_payloads(&CombineOp::CrossValidation {
            metric: "accuracy".to_string()
        }));
    }
}
