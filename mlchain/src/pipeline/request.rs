//! Declarative pipeline requests.

use serde::{Deserialize, Serialize};

use crate::combiner::CombineMethod;
use crate::core::{Recipe, RemoteId};
use crate::errors::MalformedRequestError;

/// Where a pipeline's data comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum DataInput {
    /// Raw data to upload.
    Raw {
        /// File path or URL understood by the remote client.
        path: String,
    },
    /// An already created source.
    Source {
        /// The source id.
        id: RemoteId,
    },
    /// An already created dataset.
    Dataset {
        /// The dataset id.
        id: RemoteId,
    },
}

/// How the pipeline obtains its model(s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ModelInput {
    /// Build models from the training dataset.
    Recipe(ModelRecipe),
    /// Use one already created model.
    Existing {
        /// The model id.
        id: RemoteId,
    },
    /// Use already created models as an ensemble.
    ExistingEnsemble {
        /// The member model ids, in member order.
        ids: Vec<RemoteId>,
    },
}

/// Options for building models.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRecipe {
    /// Options forwarded to every model create call.
    #[serde(default)]
    pub options: Recipe,
    /// Number of ensemble members; `None` or 1 builds a single model.
    #[serde(default)]
    pub ensemble_size: Option<u32>,
}

impl ModelRecipe {
    /// A single-model recipe with no options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one model option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Builds an ensemble of `size` members.
    #[must_use]
    pub fn with_ensemble(mut self, size: u32) -> Self {
        self.ensemble_size = Some(size);
        self
    }
}

/// Splitting of the test data into independently predicted row ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    /// Rows in the test data.
    pub total_rows: usize,
    /// Rows per partition; the last partition takes the remainder.
    pub partition_rows: usize,
}

impl PartitionPlan {
    /// Creates a partition plan.
    #[must_use]
    pub fn new(total_rows: usize, partition_rows: usize) -> Self {
        Self {
            total_rows,
            partition_rows,
        }
    }

    /// Half-open row ranges covering `0..total_rows` in order.
    #[must_use]
    pub fn ranges(&self) -> Vec<(usize, usize)> {
        if self.partition_rows == 0 {
            return Vec::new();
        }
        (0..self.total_rows)
            .step_by(self.partition_rows)
            .map(|start| (start, (start + self.partition_rows).min(self.total_rows)))
            .collect()
    }
}

/// An artifact the caller wants at the end of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "goal", rename_all = "snake_case")]
pub enum Goal {
    /// The training dataset.
    Dataset,
    /// The model, or the ensemble when the recipe builds one.
    Model,
    /// An evaluation of the model on the test data (or a holdout).
    Evaluation,
    /// Predictions for every test row.
    Predictions,
    /// A k-fold cross-validation of the recipe.
    CrossValidation {
        /// Number of folds.
        folds: u32,
        /// Metric averaged across folds.
        metric: String,
    },
}

impl Goal {
    /// Short label used in results.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Dataset => "dataset".to_string(),
            Self::Model => "model".to_string(),
            Self::Evaluation => "evaluation".to_string(),
            Self::Predictions => "predictions".to_string(),
            Self::CrossValidation { folds, metric } => format!("cross_validation:{folds}:{metric}"),
        }
    }

    /// Returns true if the goal needs a model.
    #[must_use]
    pub fn needs_model(&self) -> bool {
        matches!(self, Self::Model | Self::Evaluation | Self::Predictions)
    }
}

/// A declarative description of the artifacts to produce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    /// Name given to every created resource.
    #[serde(default)]
    pub name: Option<String>,
    /// Tags given to every created resource.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Training data.
    #[serde(default)]
    pub training: Option<DataInput>,
    /// Model source; defaults to an option-less recipe over the training data.
    #[serde(default)]
    pub model: Option<ModelInput>,
    /// Test data for evaluations and predictions.
    #[serde(default)]
    pub test: Option<DataInput>,
    /// Requested end artifacts.
    #[serde(default)]
    pub goals: Vec<Goal>,
    /// Optional batch partitioning of predictions.
    #[serde(default)]
    pub partitions: Option<PartitionPlan>,
    /// How ensemble predictions are combined.
    #[serde(default)]
    pub combine_method: CombineMethod,
}

impl PipelineRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the training data.
    #[must_use]
    pub fn with_training(mut self, input: DataInput) -> Self {
        self.training = Some(input);
        self
    }

    /// Sets the model source.
    #[must_use]
    pub fn with_model(mut self, input: ModelInput) -> Self {
        self.model = Some(input);
        self
    }

    /// Sets the test data.
    #[must_use]
    pub fn with_test(mut self, input: DataInput) -> Self {
        self.test = Some(input);
        self
    }

    /// Adds a goal.
    #[must_use]
    pub fn with_goal(mut self, goal: Goal) -> Self {
        self.goals.push(goal);
        self
    }

    /// Partitions predictions.
    #[must_use]
    pub fn with_partitions(mut self, plan: PartitionPlan) -> Self {
        self.partitions = Some(plan);
        self
    }

    /// Sets the ensemble combination method.
    #[must_use]
    pub fn with_combine_method(mut self, method: CombineMethod) -> Self {
        self.combine_method = method;
        self
    }

    /// Sets the resource name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a resource tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Name and tags merged into every create call.
    #[must_use]
    pub fn labels(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut labels = serde_json::Map::new();
        if let Some(ref name) = self.name {
            labels.insert("name".to_string(), serde_json::json!(name));
        }
        if !self.tags.is_empty() {
            labels.insert("tags".to_string(), serde_json::json!(self.tags));
        }
        labels
    }

    /// Parses a request from JSON.
    pub fn from_json(json: &str) -> Result<Self, MalformedRequestError> {
        serde_json::from_str(json).map_err(|e| {
            MalformedRequestError::new("MLCHAIN-REQUEST-PARSE", format!("invalid request: {e}"))
        })
    }
}
