//! The pipeline graph: an insertion-ordered DAG of stages.

use serde::Serialize;
use std::collections::HashMap;

use super::fingerprint::stage_id;
use super::Goal;
use crate::core::{Stage, StageId, StageParams};
use crate::errors::MalformedRequestError;

/// A requested end artifact and the stage that produces it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    /// The requested goal.
    pub goal: Goal,
    /// The stage producing it.
    pub stage_id: StageId,
}

/// A directed acyclic graph of stages.
///
/// Stages can only be linked to stages inserted before them, so insertion
/// order is a topological order and cycles cannot be expressed.
#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    /// Stages in insertion order.
    stages: Vec<Stage>,
    /// Stage id to position in `stages`.
    index: HashMap<StageId, usize>,
    /// Requested end artifacts.
    targets: Vec<Target>,
    /// Name and tags merged into create calls.
    labels: serde_json::Map<String, serde_json::Value>,
}

impl PipelineGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new(labels: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            labels,
            ..Self::default()
        }
    }

    /// Inserts a stage and returns its id.
    ///
    /// Inserting a stage whose id already exists returns the existing id, so
    /// goals that share upstream work share stages.
    pub(crate) fn insert(
        &mut self,
        params: StageParams,
        inputs: Vec<StageId>,
    ) -> Result<StageId, MalformedRequestError> {
        if let Some(missing) = inputs.iter().find(|input| !self.index.contains_key(*input)) {
            return Err(MalformedRequestError::new(
                "MLCHAIN-GRAPH-MISSING_INPUT",
                format!("stage input '{missing}' is not in the graph"),
            ));
        }

        let id = stage_id(&params, &inputs);
        if self.index.contains_key(&id) {
            return Ok(id);
        }

        self.index.insert(id.clone(), self.stages.len());
        self.stages.push(Stage::new(id.clone(), params, inputs));
        Ok(id)
    }

    /// Records a requested end artifact.
    pub(crate) fn add_target(&mut self, goal: Goal, stage_id: StageId) {
        self.targets.push(Target { goal, stage_id });
    }

    /// Stages in insertion order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Looks a stage up by id.
    #[must_use]
    pub fn get(&self, id: &StageId) -> Option<&Stage> {
        self.index.get(id).map(|&pos| &self.stages[pos])
    }

    /// Position of a stage in insertion order.
    #[must_use]
    pub fn position(&self, id: &StageId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Requested end artifacts.
    #[must_use]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Name and tags merged into create calls.
    #[must_use]
    pub fn labels(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.labels
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage ids in insertion order.
    #[must_use]
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id.clone()).collect()
    }

    /// For each stage position, the positions of stages consuming it.
    #[must_use]
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.stages.len()];
        for (pos, stage) in self.stages.iter().enumerate() {
            for input in &stage.inputs {
                if let Some(&input_pos) = self.index.get(input) {
                    dependents[input_pos].push(pos);
                }
            }
        }
        dependents
    }

    /// Returns true if `ancestor` is reachable by following inputs from `id`.
    #[must_use]
    pub fn depends_on(&self, id: &StageId, ancestor: &StageId) -> bool {
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            let Some(stage) = self.get(&current) else {
                continue;
            };
            for input in &stage.inputs {
                if input == ancestor {
                    return true;
                }
                stack.push(input.clone());
            }
        }
        false
    }
}
