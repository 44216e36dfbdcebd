//! Expansion of pipeline requests into stage graphs.

use super::{DataInput, Goal, ModelInput, ModelRecipe, PipelineGraph, PipelineRequest};
use crate::core::{CombineOp, DataRole, RemoteId, ResourceKind, Sampling, StageId, StageKind, StageParams};
use crate::errors::MalformedRequestError;

/// Models produced for the request.
#[derive(Debug, Clone)]
enum Models {
    /// One model stage.
    Single(StageId),
    /// Member model stages and the combine stage collecting them.
    Ensemble {
        members: Vec<StageId>,
        ensemble: StageId,
    },
}

/// Builds a [`PipelineGraph`] from a [`PipelineRequest`].
///
/// Construction is pure: nothing is created remotely and the same request
/// always yields the same graph with the same stage ids.
#[derive(Debug)]
pub struct PipelineBuilder<'a> {
    request: &'a PipelineRequest,
    graph: PipelineGraph,
    training: Option<StageId>,
    test: Option<StageId>,
    models: Option<Models>,
    holdout: bool,
}

impl<'a> PipelineBuilder<'a> {
    /// Creates a builder for a request.
    #[must_use]
    pub fn new(request: &'a PipelineRequest) -> Self {
        // Evaluating a recipe-built model without test data holds out part of
        // the training data instead.
        let holdout = request.goals.contains(&Goal::Evaluation)
            && request.test.is_none()
            && request.training.is_some()
            && matches!(request.model, None | Some(ModelInput::Recipe(_)));

        Self {
            request,
            graph: PipelineGraph::new(request.labels()),
            training: None,
            test: None,
            models: None,
            holdout,
        }
    }

    /// Expands every goal and returns the graph.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedRequestError`] if a goal cannot be produced from the
    /// request's inputs.
    pub fn build(mut self) -> Result<PipelineGraph, MalformedRequestError> {
        if self.request.goals.is_empty() {
            return Err(MalformedRequestError::new(
                "MLCHAIN-REQUEST-EMPTY",
                "the request names no goals",
            )
            .with_fix_hint("Add at least one goal (dataset, model, evaluation, predictions, cross_validation)."));
        }
        self.validate_partitions()?;

        for goal in &self.request.goals {
            let target = self.expand_goal(goal)?;
            self.graph.add_target(goal.clone(), target);
        }

        tracing::debug!(
            stages = self.graph.len(),
            targets = self.graph.targets().len(),
            "Pipeline graph built"
        );
        Ok(self.graph)
    }

    fn validate_partitions(&self) -> Result<(), MalformedRequestError> {
        let Some(plan) = self.request.partitions else {
            return Ok(());
        };
        if plan.total_rows == 0 || plan.partition_rows == 0 {
            return Err(MalformedRequestError::new(
                "MLCHAIN-REQUEST-BAD_PARTITIONS",
                format!(
                    "partition plan needs positive sizes, got {} rows in partitions of {}",
                    plan.total_rows, plan.partition_rows
                ),
            ));
        }
        if !self.request.goals.contains(&Goal::Predictions) {
            return Err(MalformedRequestError::new(
                "MLCHAIN-REQUEST-BAD_PARTITIONS",
                "batch partitioning only applies to the predictions goal",
            ));
        }
        Ok(())
    }

    fn expand_goal(&mut self, goal: &Goal) -> Result<StageId, MalformedRequestError> {
        match goal {
            Goal::Dataset => self.training_dataset(),
            Goal::Model => match self.models(goal)? {
                Models::Single(model) => Ok(model),
                Models::Ensemble { ensemble, .. } => Ok(ensemble),
            },
            Goal::Evaluation => self.evaluation(),
            Goal::Predictions => self.predictions(),
            Goal::CrossValidation { folds, metric } => self.cross_validation(*folds, metric),
        }
    }

    fn insert(
        &mut self,
        params: StageParams,
        inputs: Vec<StageId>,
    ) -> Result<StageId, MalformedRequestError> {
        self.graph.insert(params, inputs)
    }

    /// Adds an already created resource as a root stage.
    ///
    /// Ids shaped like `kind/...` must name the resource kind the stage
    /// stands for; opaque ids are taken as given.
    fn existing(&mut self, kind: StageKind, remote_id: RemoteId) -> Result<StageId, MalformedRequestError> {
        if let (Some(expected), Some(found)) = (ResourceKind::for_stage(kind), remote_id.resource_type()) {
            if found != expected.param_key() {
                return Err(MalformedRequestError::new(
                    "MLCHAIN-REQUEST-WRONG_RESOURCE",
                    format!("'{remote_id}' is a {found}, but a {expected} was expected"),
                )
                .with_fix_hint(format!("Pass a {expected} id such as '{expected}/<id>'.")));
            }
        }
        self.insert(StageParams::Existing { kind, remote_id }, Vec::new())
    }

    fn dataset_from(
        &mut self,
        input: &DataInput,
        role: DataRole,
    ) -> Result<StageId, MalformedRequestError> {
        let dataset = StageParams::Dataset { role, folds: None };
        match input {
            DataInput::Raw { path } => {
                let source = self.insert(
                    StageParams::Source {
                        data: path.clone(),
                        role,
                    },
                    Vec::new(),
                )?;
                self.insert(dataset, vec![source])
            }
            DataInput::Source { id } => {
                let source = self.existing(StageKind::Source, id.clone())?;
                self.insert(dataset, vec![source])
            }
            DataInput::Dataset { id } => self.existing(StageKind::Dataset, id.clone()),
        }
    }

    fn training_dataset(&mut self) -> Result<StageId, MalformedRequestError> {
        if let Some(ref id) = self.training {
            return Ok(id.clone());
        }
        let Some(input) = self.request.training.as_ref() else {
            return Err(MalformedRequestError::new(
                "MLCHAIN-REQUEST-NO_TRAINING",
                "the request needs training data but has none",
            )
            .with_fix_hint("Provide raw training data, a source id or a dataset id."));
        };
        let id = self.dataset_from(input, DataRole::Training)?;
        self.training = Some(id.clone());
        Ok(id)
    }

    fn test_dataset(&mut self, goal: &Goal) -> Result<StageId, MalformedRequestError> {
        if let Some(ref id) = self.test {
            return Ok(id.clone());
        }
        let Some(input) = self.request.test.as_ref() else {
            return Err(MalformedRequestError::new(
                "MLCHAIN-REQUEST-NO_TEST",
                format!("goal '{}' needs test data but the request has none", goal.label()),
            ));
        };
        let id = self.dataset_from(input, DataRole::Test)?;
        self.test = Some(id.clone());
        Ok(id)
    }

    fn models(&mut self, goal: &Goal) -> Result<Models, MalformedRequestError> {
        if let Some(ref models) = self.models {
            return Ok(models.clone());
        }

        let models = match self.request.model.clone() {
            Some(ModelInput::Existing { id }) => Models::Single(self.existing(StageKind::Model, id)?),
            Some(ModelInput::ExistingEnsemble { ids }) => {
                if ids.is_empty() {
                    return Err(MalformedRequestError::new(
                        "MLCHAIN-REQUEST-EMPTY_ENSEMBLE",
                        "an existing ensemble needs at least one model id",
                    ));
                }
                let members = ids
                    .into_iter()
                    .map(|remote_id| self.existing(StageKind::EnsembleMember, remote_id))
                    .collect::<Result<Vec<_>, _>>()?;
                let ensemble = self.insert(StageParams::Combine(CombineOp::Ensemble), members.clone())?;
                Models::Ensemble { members, ensemble }
            }
            Some(ModelInput::Recipe(recipe)) => self.models_from_recipe(goal, &recipe)?,
            None => self.models_from_recipe(goal, &ModelRecipe::default())?,
        };

        self.models = Some(models.clone());
        Ok(models)
    }

    fn models_from_recipe(
        &mut self,
        goal: &Goal,
        recipe: &ModelRecipe,
    ) -> Result<Models, MalformedRequestError> {
        if self.request.training.is_none() {
            return Err(MalformedRequestError::new(
                "MLCHAIN-REQUEST-NO_MODEL",
                format!(
                    "goal '{}' needs a model, but the request has neither training data nor an existing model",
                    goal.label()
                ),
            )
            .with_fix_hint("Provide training data or an existing model id."));
        }
        let dataset = self.training_dataset()?;
        let sampling = self.holdout.then(Sampling::holdout_train);

        match recipe.ensemble_size {
            Some(0) => Err(MalformedRequestError::new(
                "MLCHAIN-REQUEST-EMPTY_ENSEMBLE",
                "ensemble size must be at least 1",
            )),
            Some(size) if size > 1 => {
                let members = (0..size)
                    .map(|index| {
                        self.insert(
                            StageParams::EnsembleMember {
                                index,
                                recipe: recipe.options.clone(),
                                sampling: sampling.clone(),
                            },
                            vec![dataset.clone()],
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let ensemble = self.insert(StageParams::Combine(CombineOp::Ensemble), members.clone())?;
                Ok(Models::Ensemble { members, ensemble })
            }
            _ => Ok(Models::Single(self.insert(
                StageParams::Model {
                    recipe: recipe.options.clone(),
                    sampling,
                },
                vec![dataset],
            )?)),
        }
    }

    fn evaluation(&mut self) -> Result<StageId, MalformedRequestError> {
        let goal = Goal::Evaluation;
        let Models::Single(model) = self.models(&goal)? else {
            return Err(MalformedRequestError::new(
                "MLCHAIN-REQUEST-ENSEMBLE_EVALUATION",
                "evaluations are defined for a single model, not an ensemble",
            )
            .with_fix_hint("Request predictions for the ensemble, or evaluate a single model."));
        };

        let (dataset, sampling) = if self.holdout {
            (self.training_dataset()?, Some(Sampling::holdout_test()))
        } else {
            (self.test_dataset(&goal)?, None)
        };

        self.insert(
            StageParams::Evaluation {
                fold: None,
                sampling,
            },
            vec![model, dataset],
        )
    }

    fn predictions(&mut self) -> Result<StageId, MalformedRequestError> {
        let goal = Goal::Predictions;
        let models = self.models(&goal)?;
        let test = self.test_dataset(&goal)?;
        let ranges = self.request.partitions.map(|plan| plan.ranges());
        let method = self.request.combine_method;

        match (models, ranges) {
            (Models::Single(model), None) => self.insert(StageParams::Prediction, vec![model, test]),
            (Models::Single(model), Some(ranges)) => {
                let parts = self.partitions(&model, &test, &ranges)?;
                self.insert(StageParams::Combine(CombineOp::Stitch { ranges }), parts)
            }
            (Models::Ensemble { members, .. }, None) => {
                let predictions = members
                    .iter()
                    .map(|member| self.insert(StageParams::Prediction, vec![member.clone(), test.clone()]))
                    .collect::<Result<Vec<_>, _>>()?;
                self.insert(StageParams::Combine(CombineOp::Vote { method }), predictions)
            }
            (Models::Ensemble { members, .. }, Some(ranges)) => {
                let mut votes = Vec::with_capacity(ranges.len());
                for (index, &(start, end)) in ranges.iter().enumerate() {
                    let index = partition_index(index)?;
                    let parts = members
                        .iter()
                        .map(|member| {
                            self.insert(
                                StageParams::BatchPartition { index, start, end },
                                vec![member.clone(), test.clone()],
                            )
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    votes.push(self.insert(StageParams::Combine(CombineOp::Vote { method }), parts)?);
                }
                self.insert(StageParams::Combine(CombineOp::Stitch { ranges }), votes)
            }
        }
    }

    fn partitions(
        &mut self,
        model: &StageId,
        test: &StageId,
        ranges: &[(usize, usize)],
    ) -> Result<Vec<StageId>, MalformedRequestError> {
        ranges
            .iter()
            .enumerate()
            .map(|(index, &(start, end))| {
                self.insert(
                    StageParams::BatchPartition {
                        index: partition_index(index)?,
                        start,
                        end,
                    },
                    vec![model.clone(), test.clone()],
                )
            })
            .collect()
    }

    fn cross_validation(&mut self, folds: u32, metric: &str) -> Result<StageId, MalformedRequestError> {
        if folds < 2 {
            return Err(MalformedRequestError::new(
                "MLCHAIN-REQUEST-BAD_FOLDS",
                format!("cross-validation needs at least 2 folds, got {folds}"),
            ));
        }
        if metric.trim().is_empty() {
            return Err(MalformedRequestError::new(
                "MLCHAIN-REQUEST-BAD_METRIC",
                "cross-validation needs a metric name",
            ));
        }
        let recipe = match self.request.model {
            None => ModelRecipe::default(),
            Some(ModelInput::Recipe(ref recipe)) => recipe.clone(),
            Some(_) => {
                return Err(MalformedRequestError::new(
                    "MLCHAIN-REQUEST-CV_NEEDS_RECIPE",
                    "cross-validation builds its own fold models and needs a model recipe",
                ))
            }
        };

        let dataset = self.training_dataset()?;
        let split = self.insert(
            StageParams::Dataset {
                role: DataRole::Training,
                folds: Some(folds),
            },
            vec![dataset],
        )?;

        let mut evaluations = Vec::with_capacity(folds as usize);
        for fold in 0..folds {
            let model = self.insert(
                StageParams::CrossValidationFold {
                    fold,
                    folds,
                    recipe: recipe.options.clone(),
                },
                vec![split.clone()],
            )?;
            evaluations.push(self.insert(
                StageParams::Evaluation {
                    fold: Some(fold),
                    sampling: None,
                },
                vec![model, split.clone()],
            )?);
        }

        self.insert(
            StageParams::Combine(CombineOp::CrossValidation {
                metric: metric.to_string(),
            }),
            evaluations,
        )
    }
}

fn partition_index(index: usize) -> Result<u32, MalformedRequestError> {
    u32::try_from(index).map_err(|_| {
        MalformedRequestError::new(
            "MLCHAIN-REQUEST-BAD_PARTITIONS",
            format!("too many partitions ({index})"),
        )
    })
}
