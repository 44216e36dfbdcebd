//! Resource handle registry.
//!
//! Maps stage ids to the remote resource built for them and its local
//! status. The scheduler's workers are the only writers; the executor and the
//! combiner read handles to resolve input remote ids and upstream artifacts.
//! Handles live for one run and are rebuilt from the execution log.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::combiner::CombinedArtifact;
use crate::core::{RemoteId, StageId};
use crate::resume::ResumeSnapshot;

/// Local status of a resource handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    /// Nothing issued yet.
    #[default]
    Pending,
    /// A remote id is known but not confirmed ready.
    Building,
    /// The resource is confirmed ready, or the combine stage has its artifact.
    Ready,
    /// The stage failed.
    Failed,
}

/// A stage's remote resource and its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// The owning stage.
    pub stage_id: StageId,
    /// The remote resource, once issued.
    pub remote_id: Option<RemoteId>,
    /// Local status.
    pub status: HandleStatus,
    /// Locally computed result, for combine stages.
    pub artifact: Option<CombinedArtifact>,
}

impl ResourceHandle {
    fn pending(stage_id: StageId) -> Self {
        Self {
            stage_id,
            remote_id: None,
            status: HandleStatus::Pending,
            artifact: None,
        }
    }
}

/// Concurrent map of resource handles.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    handles: DashMap<StageId, ResourceHandle>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers pending handles for `stage_ids`, then applies what the
    /// execution log recorded: completed stages become ready, stages issued
    /// but never completed become building with their known remote id.
    pub fn seed<'a>(&self, stage_ids: impl IntoIterator<Item = &'a StageId>, snapshot: &ResumeSnapshot) {
        for stage_id in stage_ids {
            let mut handle = ResourceHandle::pending(stage_id.clone());
            if let Some(remote_id) = snapshot.completed(stage_id) {
                handle.remote_id = Some(remote_id.clone());
                handle.status = HandleStatus::Ready;
            } else if let Some(remote_id) = snapshot.in_flight(stage_id) {
                handle.remote_id = Some(remote_id.clone());
                handle.status = HandleStatus::Building;
            }
            self.handles.insert(stage_id.clone(), handle);
        }
    }

    fn update(&self, stage_id: &StageId, apply: impl FnOnce(&mut ResourceHandle)) -> bool {
        let mut entry = self
            .handles
            .entry(stage_id.clone())
            .or_insert_with(|| ResourceHandle::pending(stage_id.clone()));
        if entry.status == HandleStatus::Ready {
            tracing::warn!(stage_id = %stage_id, "Ignoring update of a ready handle");
            return false;
        }
        apply(entry.value_mut());
        true
    }

    /// Records an issued but unconfirmed remote id.
    pub fn mark_building(&self, stage_id: &StageId, remote_id: RemoteId) -> bool {
        self.update(stage_id, |handle| {
            handle.remote_id = Some(remote_id);
            handle.status = HandleStatus::Building;
        })
    }

    /// Records a confirmed remote resource. Ready handles never change again.
    pub fn mark_ready(&self, stage_id: &StageId, remote_id: RemoteId) -> bool {
        self.update(stage_id, |handle| {
            handle.remote_id = Some(remote_id);
            handle.status = HandleStatus::Ready;
        })
    }

    /// Records a combine stage's artifact.
    pub fn mark_combined(&self, stage_id: &StageId, artifact: CombinedArtifact) -> bool {
        self.update(stage_id, |handle| {
            handle.artifact = Some(artifact);
            handle.status = HandleStatus::Ready;
        })
    }

    /// Records a failure. Any known remote id is kept for later reattachment.
    pub fn mark_failed(&self, stage_id: &StageId) -> bool {
        self.update(stage_id, |handle| handle.status = HandleStatus::Failed)
    }

    /// A copy of a stage's handle.
    #[must_use]
    pub fn get(&self, stage_id: &StageId) -> Option<ResourceHandle> {
        self.handles.get(stage_id).map(|h| h.clone())
    }

    /// A stage's status, `Pending` if unknown.
    #[must_use]
    pub fn status(&self, stage_id: &StageId) -> HandleStatus {
        self.handles.get(stage_id).map_or(HandleStatus::Pending, |h| h.status)
    }

    /// A stage's remote id, if known.
    #[must_use]
    pub fn remote_id(&self, stage_id: &StageId) -> Option<RemoteId> {
        self.handles.get(stage_id).and_then(|h| h.remote_id.clone())
    }

    /// A ready combine stage's artifact.
    #[must_use]
    pub fn artifact(&self, stage_id: &StageId) -> Option<CombinedArtifact> {
        self.handles
            .get(stage_id)
            .filter(|h| h.status == HandleStatus::Ready)
            .and_then(|h| h.artifact.clone())
    }

    /// The remote id to poll instead of creating, for a building stage.
    #[must_use]
    pub fn reattachable(&self, stage_id: &StageId) -> Option<RemoteId> {
        self.handles
            .get(stage_id)
            .filter(|h| h.status == HandleStatus::Building)
            .and_then(|h| h.remote_id.clone())
    }

    /// Number of handles with the given status.
    #[must_use]
    pub fn count(&self, status: HandleStatus) -> usize {
        self.handles.iter().filter(|h| h.status == status).count()
    }

    /// Number of handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if the registry holds no handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
