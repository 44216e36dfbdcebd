//! Results of a pipeline run.

use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::combiner::CombinedArtifact;
use crate::core::{RemoteId, Stage, StageId, StageKind, StageStatus};
use crate::errors::StageError;
use crate::pipeline::{FailureSummary, Goal};

/// Final state of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    /// The stage.
    pub stage_id: StageId,
    /// Its kind.
    pub kind: StageKind,
    /// Final status.
    pub status: StageStatus,
    /// The remote resource, if one is known.
    pub remote_id: Option<RemoteId>,
    /// Failure detail.
    pub error: Option<StageError>,
}

impl From<&Stage> for StageReport {
    fn from(stage: &Stage) -> Self {
        Self {
            stage_id: stage.id.clone(),
            kind: stage.kind(),
            status: stage.status,
            remote_id: stage.remote_id.clone(),
            error: stage.error.clone(),
        }
    }
}

/// Outcome of one requested goal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetResult {
    /// The goal.
    pub goal: Goal,
    /// The stage producing it.
    pub stage_id: StageId,
    /// Final status of that stage.
    pub status: StageStatus,
    /// The produced remote resource, for remote targets.
    pub remote_id: Option<RemoteId>,
    /// The locally combined result, for combine targets.
    pub artifact: Option<CombinedArtifact>,
    /// Failure detail.
    pub error: Option<StageError>,
}

impl TargetResult {
    /// Returns true if the goal was produced.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status.is_satisfied()
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// The run.
    pub run_id: Uuid,
    /// Whether every target succeeded.
    pub success: bool,
    /// Per-goal outcomes, in request order.
    pub targets: Vec<TargetResult>,
    /// Every stage, in insertion order.
    pub stages: Vec<StageReport>,
    /// Failures, in the order they happened.
    pub failures: FailureSummary,
    /// Remote resources created by this run.
    pub created: usize,
    /// Stages skipped because the log recorded them as completed.
    pub resumed: usize,
    /// Stages that polled a resource issued by an earlier run.
    pub reattached: usize,
    /// Whether the run was cancelled or hit its deadline.
    pub cancelled: bool,
    /// Most stages in flight at once.
    pub peak_concurrency: usize,
    /// Total run time.
    pub duration_ms: u64,
}

impl RunResult {
    /// The outcome of a goal.
    #[must_use]
    pub fn target(&self, goal: &Goal) -> Option<&TargetResult> {
        self.targets.iter().find(|t| &t.goal == goal)
    }

    /// The final state of a stage.
    #[must_use]
    pub fn stage(&self, stage_id: &StageId) -> Option<&StageReport> {
        self.stages.iter().find(|s| &s.stage_id == stage_id)
    }

    /// Stages with the given status.
    pub fn stages_with(&self, status: StageStatus) -> impl Iterator<Item = &StageReport> {
        self.stages.iter().filter(move |s| s.status == status)
    }

    /// Remote ids of every stage that has one, keyed by stage id.
    #[must_use]
    pub fn remote_ids(&self) -> HashMap<StageId, RemoteId> {
        self.stages
            .iter()
            .filter_map(|s| s.remote_id.clone().map(|r| (s.stage_id.clone(), r)))
            .collect()
    }

    /// Summary as a JSON-friendly map.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("run_id".to_string(), serde_json::json!(self.run_id.to_string()));
        map.insert("success".to_string(), serde_json::json!(self.success));
        map.insert("created".to_string(), serde_json::json!(self.created));
        map.insert("resumed".to_string(), serde_json::json!(self.resumed));
        map.insert("reattached".to_string(), serde_json::json!(self.reattached));
        map.insert("cancelled".to_string(), serde_json::json!(self.cancelled));
        map.insert("peak_concurrency".to_string(), serde_json::json!(self.peak_concurrency));
        map.insert("duration_ms".to_string(), serde_json::json!(self.duration_ms));
        map.insert(
            "targets".to_string(),
            serde_json::to_value(&self.targets).unwrap_or_default(),
        );
        map.insert(
            "failures".to_string(),
            serde_json::to_value(self.failures.to_dict()).unwrap_or_default(),
        );
        map
    }
}
