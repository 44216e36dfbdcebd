//! Remote resource kinds and identifiers.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use super::StageKind;

/// The kind of resource the remote platform creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// An uploaded data source.
    Source,
    /// A dataset.
    Dataset,
    /// A model.
    Model,
    /// An evaluation.
    Evaluation,
    /// A batch prediction.
    BatchPrediction,
}

impl ResourceKind {
    /// The remote resource created for a stage kind, if any.
    #[must_use]
    pub fn for_stage(kind: StageKind) -> Option<Self> {
        match kind {
            StageKind::Source => Some(Self::Source),
            StageKind::Dataset => Some(Self::Dataset),
            StageKind::Model | StageKind::EnsembleMember | StageKind::CrossValidationFold => {
                Some(Self::Model)
            }
            StageKind::Evaluation => Some(Self::Evaluation),
            StageKind::Prediction | StageKind::BatchPartition => Some(Self::BatchPrediction),
            StageKind::Combine => None,
        }
    }

    /// Name used as the parameter key when this resource feeds a create call.
    #[must_use]
    pub fn param_key(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Dataset => "dataset",
            Self::Model => "model",
            Self::Evaluation => "evaluation",
            Self::BatchPrediction => "batchprediction",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.param_key())
    }
}

/// Identifier of a resource on the remote platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

fn resource_prefix() -> Option<&'static Regex> {
    static PREFIX: OnceLock<Option<Regex>> = OnceLock::new();
    PREFIX
        .get_or_init(|| Regex::new(r"^([a-z]+)/[A-Za-z0-9_-]+$").ok())
        .as_ref()
}

impl RemoteId {
    /// Wraps a platform identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the resource type prefix of ids shaped like `model/abc123`.
    #[must_use]
    pub fn resource_type(&self) -> Option<&str> {
        resource_prefix()?
            .captures(&self.0)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
