//! Stage status and kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a stage plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Raw data uploaded as a remote source.
    Source,
    /// A dataset built from a source, or split from another dataset.
    Dataset,
    /// A single model.
    Model,
    /// One model of an ensemble.
    EnsembleMember,
    /// A model trained on all folds but one.
    CrossValidationFold,
    /// An evaluation of a model against a dataset.
    Evaluation,
    /// A batch prediction over a whole dataset.
    Prediction,
    /// A batch prediction over one row range of a dataset.
    BatchPartition,
    /// A locally computed combination of other stages.
    Combine,
}

impl StageKind {
    /// Returns true if the stage is computed locally instead of remotely.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Combine)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Dataset => write!(f, "dataset"),
            Self::Model => write!(f, "model"),
            Self::EnsembleMember => write!(f, "ensemble-member"),
            Self::CrossValidationFold => write!(f, "cross-validation-fold"),
            Self::Evaluation => write!(f, "evaluation"),
            Self::Prediction => write!(f, "prediction"),
            Self::BatchPartition => write!(f, "batch-partition"),
            Self::Combine => write!(f, "combine"),
        }
    }
}

/// The execution status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting on at least one input.
    #[default]
    Pending,
    /// Every input is satisfied; waiting for a worker slot.
    ReadyToRun,
    /// Dispatched to a worker.
    Running,
    /// Completed in this run.
    Succeeded,
    /// Failed in this run, or an input failed.
    Failed,
    /// Completed in a prior run and taken from the execution log.
    SkippedResumed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::ReadyToRun => write!(f, "ready_to_run"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::SkippedResumed => write!(f, "skipped_resumed"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::SkippedResumed)
    }

    /// Returns true if dependents may consume this stage's output.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SkippedResumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::EnsembleMember.to_string(), "ensemble-member");
        assert_eq!(StageKind::CrossValidationFold.to_string(), "cross-validation-fold");
        assert_eq!(StageKind::BatchPartition.to_string(), "batch-partition");
        assert!(StageKind::Combine.is_local());
        assert!(!StageKind::Model.is_local());
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::SkippedResumed.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(!StageStatus::ReadyToRun.is_terminal());
    }

    #[test]
    fn test_stage_status_satisfied() {
        assert!(StageStatus::SkippedResumed.is_satisfied());
        assert!(!StageStatus::Failed.is_satisfied());
        assert_eq!(StageStatus::default(), StageStatus::Pending);
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::SkippedResumed).unwrap();
        assert_eq!(json, r#""skipped_resumed""#);

        let back: StageStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StageStatus::SkippedResumed);
    }
}
