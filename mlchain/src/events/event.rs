//! Lifecycle events emitted during a run.

use serde::Serialize;
use uuid::Uuid;

use crate::core::{RemoteId, StageId, StageKind};
use crate::errors::StageError;

/// A run or stage lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum PipelineEvent {
    /// The run began.
    #[serde(rename = "pipeline.started")]
    PipelineStarted {
        /// The run.
        run_id: Uuid,
        /// Stages in the graph.
        stages: usize,
        /// Stages the execution log recorded as completed.
        resumable: usize,
    },
    /// A stage was dispatched.
    #[serde(rename = "stage.started")]
    StageStarted {
        /// The stage.
        stage_id: StageId,
        /// Its kind.
        kind: StageKind,
    },
    /// A stage was skipped because the log recorded it as completed.
    #[serde(rename = "stage.resumed")]
    StageResumed {
        /// The stage.
        stage_id: StageId,
        /// The logged remote id.
        remote_id: RemoteId,
    },
    /// A stage resumed polling a resource issued by an earlier run.
    #[serde(rename = "stage.reattached")]
    StageReattached {
        /// The stage.
        stage_id: StageId,
        /// The in-flight remote id.
        remote_id: RemoteId,
    },
    /// A stage succeeded.
    #[serde(rename = "stage.completed")]
    StageCompleted {
        /// The stage.
        stage_id: StageId,
        /// The remote resource, for remote stages.
        remote_id: Option<RemoteId>,
        /// Wall time from dispatch to completion.
        duration_ms: u64,
    },
    /// A stage failed.
    #[serde(rename = "stage.failed")]
    StageFailed {
        /// The stage.
        stage_id: StageId,
        /// Why.
        error: StageError,
    },
    /// A stage was marked failed because an input failed.
    #[serde(rename = "stage.upstream_failed")]
    StageUpstreamFailed {
        /// The stage.
        stage_id: StageId,
        /// The upstream cause.
        error: StageError,
    },
    /// The run stopped dispatching.
    #[serde(rename = "pipeline.cancelled")]
    PipelineCancelled {
        /// Cancellation reason.
        reason: String,
    },
    /// The run finished.
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted {
        /// Whether every target succeeded.
        success: bool,
        /// Remote resources created during this run.
        created: usize,
        /// Stages skipped from the log.
        resumed: usize,
        /// Total run time.
        duration_ms: u64,
    },
}

impl PipelineEvent {
    /// The dotted event name, e.g. `stage.completed`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PipelineStarted { .. } => "pipeline.started",
            Self::StageStarted { .. } => "stage.started",
            Self::StageResumed { .. } => "stage.resumed",
            Self::StageReattached { .. } => "stage.reattached",
            Self::StageCompleted { .. } => "stage.completed",
            Self::StageFailed { .. } => "stage.failed",
            Self::StageUpstreamFailed { .. } => "stage.upstream_failed",
            Self::PipelineCancelled { .. } => "pipeline.cancelled",
            Self::PipelineCompleted { .. } => "pipeline.completed",
        }
    }

    /// The stage the event is about, for stage events.
    #[must_use]
    pub fn stage_id(&self) -> Option<&StageId> {
        match self {
            Self::StageStarted { stage_id, .. }
            | Self::StageResumed { stage_id, .. }
            | Self::StageReattached { stage_id, .. }
            | Self::StageCompleted { stage_id, .. }
            | Self::StageFailed { stage_id, .. }
            | Self::StageUpstreamFailed { stage_id, .. } => Some(stage_id),
            Self::PipelineStarted { .. } | Self::PipelineCancelled { .. } | Self::PipelineCompleted { .. } => None,
        }
    }

    /// The event as a JSON object, including its `event` name.
    #[must_use]
    pub fn to_data(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "event": self.name() }))
    }
}
