//! Pipeline stages and their typed parameters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{RemoteId, ResourceKind, StageKind, StageStatus};
use crate::combiner::CombineMethod;
use crate::errors::StageError;

/// Deterministic identifier of a stage, used as the resume key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    /// Wraps an already computed identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Model-building options forwarded verbatim to the platform.
///
/// A `BTreeMap` keeps serialization order stable, which the stage id relies on.
pub type Recipe = BTreeMap<String, serde_json::Value>;

/// Which data a dataset stage represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataRole {
    /// Training data.
    Training,
    /// Test data for evaluations and predictions.
    Test,
}

/// Deterministic row sampling used for holdout evaluations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    /// Fraction of rows sampled.
    pub rate: f64,
    /// Seed making the sample reproducible.
    pub seed: String,
    /// Whether to take the complement of the sample.
    pub out_of_bag: bool,
}

impl Sampling {
    /// Default holdout rate for evaluating a model on its own training data.
    pub const HOLDOUT_RATE: f64 = 0.8;
    /// Default seed for holdout sampling.
    pub const HOLDOUT_SEED: &'static str = "mlchain deterministic sampling";

    /// The training side of a holdout split.
    #[must_use]
    pub fn holdout_train() -> Self {
        Self {
            rate: Self::HOLDOUT_RATE,
            seed: Self::HOLDOUT_SEED.to_string(),
            out_of_bag: false,
        }
    }

    /// The evaluation side of a holdout split.
    #[must_use]
    pub fn holdout_test() -> Self {
        Self {
            out_of_bag: true,
            ..Self::holdout_train()
        }
    }
}

/// The local computation a combine stage performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CombineOp {
    /// Collects ensemble member models into one ensemble artifact.
    Ensemble,
    /// Aggregates per-member predictions row by row.
    Vote {
        /// The aggregation rule.
        method: CombineMethod,
    },
    /// Concatenates per-partition predictions in row order.
    Stitch {
        /// Half-open row range of each input, in input order.
        ranges: Vec<(usize, usize)>,
    },
    /// Averages an evaluation metric across folds.
    CrossValidation {
        /// The metric name.
        metric: String,
    },
}

/// Typed parameters of a stage, one variant per stage shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageParams {
    /// A resource that already exists remotely and is never created.
    Existing {
        /// The role the resource plays.
        kind: StageKind,
        /// The resource id.
        remote_id: RemoteId,
    },
    /// Upload raw data.
    Source {
        /// Location of the raw data.
        data: String,
        /// Training or test data.
        role: DataRole,
    },
    /// Build a dataset, optionally prepared for k-fold splitting.
    Dataset {
        /// Training or test data.
        role: DataRole,
        /// Number of folds when this dataset is a cross-validation split.
        folds: Option<u32>,
    },
    /// Build one model.
    Model {
        /// Model options.
        recipe: Recipe,
        /// Holdout sampling, when the model is evaluated on its own data.
        sampling: Option<Sampling>,
    },
    /// Build one ensemble member.
    EnsembleMember {
        /// Member index within the ensemble.
        index: u32,
        /// Model options.
        recipe: Recipe,
        /// Holdout sampling, when the ensemble is evaluated on its own data.
        sampling: Option<Sampling>,
    },
    /// Build the model for one cross-validation fold.
    CrossValidationFold {
        /// The held-out fold.
        fold: u32,
        /// Total number of folds.
        folds: u32,
        /// Model options.
        recipe: Recipe,
    },
    /// Evaluate a model.
    Evaluation {
        /// The held-out fold, for cross-validation evaluations.
        fold: Option<u32>,
        /// Holdout sampling of the evaluation dataset.
        sampling: Option<Sampling>,
    },
    /// Predict every row of a dataset.
    Prediction,
    /// Predict one row range of a dataset.
    BatchPartition {
        /// Partition index.
        index: u32,
        /// First row, inclusive.
        start: usize,
        /// Last row, exclusive.
        end: usize,
    },
    /// Combine inputs locally.
    Combine(CombineOp),
}

impl StageParams {
    /// The stage kind these parameters describe.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Existing { kind, .. } => *kind,
            Self::Source { .. } => StageKind::Source,
            Self::Dataset { .. } => StageKind::Dataset,
            Self::Model { .. } => StageKind::Model,
            Self::EnsembleMember { .. } => StageKind::EnsembleMember,
            Self::CrossValidationFold { .. } => StageKind::CrossValidationFold,
            Self::Evaluation { .. } => StageKind::Evaluation,
            Self::Prediction => StageKind::Prediction,
            Self::BatchPartition { .. } => StageKind::BatchPartition,
            Self::Combine(_) => StageKind::Combine,
        }
    }

    /// The remote id of an adopted resource.
    #[must_use]
    pub fn existing_remote_id(&self) -> Option<&RemoteId> {
        match self {
            Self::Existing { remote_id, .. } => Some(remote_id),
            _ => None,
        }
    }

    /// Builds the parameter object for the platform's create call.
    ///
    /// `inputs` pairs each input's resource kind with its remote id; each
    /// becomes a `"<kind>": "<id>"` entry. `labels` (name, tags) are merged
    /// last and are not part of the stage id.
    #[must_use]
    pub fn create_params(
        &self,
        inputs: &[(ResourceKind, RemoteId)],
        labels: &serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Value {
        let mut params = serde_json::Map::new();
        for (kind, remote_id) in inputs {
            params.insert(kind.param_key().to_string(), serde_json::json!(remote_id));
        }

        match self {
            Self::Source { data, role } => {
                params.insert("data".to_string(), serde_json::json!(data));
                params.insert("role".to_string(), serde_json::json!(role));
            }
            Self::Dataset { folds, .. } => {
                if let Some(folds) = folds {
                    params.insert("folds".to_string(), serde_json::json!(folds));
                }
            }
            Self::Model { recipe, sampling } | Self::EnsembleMember { recipe, sampling, .. } => {
                params.extend(recipe.iter().map(|(k, v)| (k.clone(), v.clone())));
                insert_sampling(&mut params, sampling.as_ref());
                if let Self::EnsembleMember { index, .. } = self {
                    params.insert("member".to_string(), serde_json::json!(index));
                }
            }
            Self::CrossValidationFold { fold, folds, recipe } => {
                params.extend(recipe.iter().map(|(k, v)| (k.clone(), v.clone())));
                params.insert("exclude_fold".to_string(), serde_json::json!(fold));
                params.insert("folds".to_string(), serde_json::json!(folds));
            }
            Self::Evaluation { fold, sampling } => {
                if let Some(fold) = fold {
                    params.insert("fold".to_string(), serde_json::json!(fold));
                }
                insert_sampling(&mut params, sampling.as_ref());
            }
            Self::BatchPartition { start, end, .. } => {
                params.insert("row_offset".to_string(), serde_json::json!(start));
                params.insert("row_count".to_string(), serde_json::json!(end - start));
            }
            Self::Existing { .. } | Self::Prediction | Self::Combine(_) => {}
        }

        for (key, value) in labels {
            params.insert(key.clone(), value.clone());
        }
        serde_json::Value::Object(params)
    }
}

fn insert_sampling(params: &mut serde_json::Map<String, serde_json::Value>, sampling: Option<&Sampling>) {
    if let Some(sampling) = sampling {
        params.insert("sample_rate".to_string(), serde_json::json!(sampling.rate));
        params.insert("seed".to_string(), serde_json::json!(sampling.seed));
        params.insert("out_of_bag".to_string(), serde_json::json!(sampling.out_of_bag));
    }
}

/// A unit of pipeline work together with its runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Deterministic id derived from kind, input ids and params.
    pub id: StageId,
    /// The stage's typed parameters.
    pub params: StageParams,
    /// Upstream stage ids, in a fixed order.
    pub inputs: Vec<StageId>,
    /// Current status.
    #[serde(default)]
    pub status: StageStatus,
    /// Remote resource produced for this stage.
    pub remote_id: Option<RemoteId>,
    /// Failure detail, when failed.
    pub error: Option<StageError>,
}

impl Stage {
    /// Creates a pending stage.
    #[must_use]
    pub fn new(id: StageId, params: StageParams, inputs: Vec<StageId>) -> Self {
        Self {
            id,
            params,
            inputs,
            status: StageStatus::Pending,
            remote_id: None,
            error: None,
        }
    }

    /// The stage kind.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        self.params.kind()
    }

    /// The remote resource this stage creates, if it creates one.
    #[must_use]
    pub fn resource_kind(&self) -> Option<ResourceKind> {
        if self.params.existing_remote_id().is_some() {
            return None;
        }
        ResourceKind::for_stage(self.kind())
    }
}
