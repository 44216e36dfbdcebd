//! Resume support: the execution log and its snapshot.
//!
//! Every completed stage is appended to an execution log before the stage is
//! reported as done. A later run over the same request replays the log and
//! skips completed stages, so re-running a finished pipeline creates nothing.
//!
//! Stages whose create call was issued but never completed are also logged,
//! which lets a later run reattach to the in-flight resource instead of
//! creating a duplicate. A resource the platform reports as failed is logged
//! once more so later runs issue a fresh one.

mod execution_log;
mod lock;

pub use execution_log::FileResumeStore;
pub use lock::RunLock;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::{RemoteId, StageId};
use crate::errors::MlchainError;
use crate::utils::{iso_timestamp, parse_timestamp, Timestamp};

/// Whether a run reads the existing execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Discard existing records and start over.
    Fresh,
    /// Skip stages the log records as completed.
    #[default]
    ResumeIfPossible,
}

/// One execution log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    /// The create call for a stage returned a remote id.
    Issued {
        /// The stage.
        stage_id: StageId,
        /// The resource being built.
        remote_id: RemoteId,
        /// ISO 8601 time of the record.
        issued_at: String,
    },
    /// The stage's remote resource reached the ready state.
    Completed {
        /// The stage.
        stage_id: StageId,
        /// The finished resource.
        remote_id: RemoteId,
        /// ISO 8601 time of the record.
        completed_at: String,
    },
    /// The stage's remote resource reached the failed state.
    Failed {
        /// The stage.
        stage_id: StageId,
        /// The failed resource.
        remote_id: RemoteId,
        /// ISO 8601 time of the record.
        failed_at: String,
    },
}

impl LogEntry {
    /// An issued record stamped with the current time.
    #[must_use]
    pub fn issued(stage_id: StageId, remote_id: RemoteId) -> Self {
        Self::Issued {
            stage_id,
            remote_id,
            issued_at: iso_timestamp(),
        }
    }

    /// A completed record stamped with the current time.
    #[must_use]
    pub fn completed(stage_id: StageId, remote_id: RemoteId) -> Self {
        Self::Completed {
            stage_id,
            remote_id,
            completed_at: iso_timestamp(),
        }
    }

    /// A failed record stamped with the current time.
    #[must_use]
    pub fn failed(stage_id: StageId, remote_id: RemoteId) -> Self {
        Self::Failed {
            stage_id,
            remote_id,
            failed_at: iso_timestamp(),
        }
    }

    /// The stage the record is about.
    #[must_use]
    pub fn stage_id(&self) -> &StageId {
        match self {
            Self::Issued { stage_id, .. } | Self::Completed { stage_id, .. } | Self::Failed { stage_id, .. } => {
                stage_id
            }
        }
    }

    /// The remote id the record carries.
    #[must_use]
    pub fn remote_id(&self) -> &RemoteId {
        match self {
            Self::Issued { remote_id, .. } | Self::Completed { remote_id, .. } | Self::Failed { remote_id, .. } => {
                remote_id
            }
        }
    }

    /// When the record was written, if its timestamp parses.
    #[must_use]
    pub fn recorded_at(&self) -> Option<Timestamp> {
        match self {
            Self::Issued { issued_at: at, .. }
            | Self::Completed { completed_at: at, .. }
            | Self::Failed { failed_at: at, .. } => parse_timestamp(at).ok(),
        }
    }
}

/// The state recovered from an execution log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeSnapshot {
    completed: HashMap<StageId, RemoteId>,
    in_flight: HashMap<StageId, RemoteId>,
}

impl ResumeSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one record into the snapshot.
    ///
    /// The first completed record for a stage wins. An issued record only
    /// counts while the stage has no completed record; a later issued record
    /// replaces an earlier one. A failed record retires the matching issued
    /// record, so the stage is neither completed nor reattachable.
    pub fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Completed {
                stage_id,
                remote_id,
                ..
            } => {
                self.in_flight.remove(&stage_id);
                if let Some(existing) = self.completed.get(&stage_id) {
                    if *existing != remote_id {
                        tracing::warn!(
                            stage_id = %stage_id,
                            kept = %existing,
                            ignored = %remote_id,
                            "Duplicate completion record, keeping the first"
                        );
                    }
                    return;
                }
                self.completed.insert(stage_id, remote_id);
            }
            LogEntry::Issued {
                stage_id,
                remote_id,
                ..
            } => {
                if !self.completed.contains_key(&stage_id) {
                    self.in_flight.insert(stage_id, remote_id);
                }
            }
            LogEntry::Failed {
                stage_id,
                remote_id,
                ..
            } => {
                if self.in_flight.get(&stage_id) == Some(&remote_id) {
                    self.in_flight.remove(&stage_id);
                }
            }
        }
    }

    /// The remote id of a completed stage.
    #[must_use]
    pub fn completed(&self, stage_id: &StageId) -> Option<&RemoteId> {
        self.completed.get(stage_id)
    }

    /// The remote id of a stage issued but never completed.
    #[must_use]
    pub fn in_flight(&self, stage_id: &StageId) -> Option<&RemoteId> {
        self.in_flight.get(stage_id)
    }

    /// Number of completed stages.
    #[must_use]
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Number of in-flight stages.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns true if nothing was recovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.in_flight.is_empty()
    }
}

/// Durable storage of stage completions.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    /// Returns the state recorded by earlier runs.
    async fn load(&self) -> Result<ResumeSnapshot, MlchainError>;

    /// Durably appends a record. Returns only once the record is persisted.
    async fn append(&self, entry: LogEntry) -> Result<(), MlchainError>;

    /// Records that a stage's create call returned `remote_id`.
    async fn record_issued(&self, stage_id: &StageId, remote_id: &RemoteId) -> Result<(), MlchainError> {
        self.append(LogEntry::issued(stage_id.clone(), remote_id.clone())).await
    }

    /// Records that a stage's resource is ready.
    async fn record_completed(&self, stage_id: &StageId, remote_id: &RemoteId) -> Result<(), MlchainError> {
        self.append(LogEntry::completed(stage_id.clone(), remote_id.clone())).await
    }

    /// Records that a stage's resource failed on the platform.
    async fn record_failed(&self, stage_id: &StageId, remote_id: &RemoteId) -> Result<(), MlchainError> {
        self.append(LogEntry::failed(stage_id.clone(), remote_id.clone())).await
    }
}

/// In-memory resume store, for tests and runs that need no persistence.
#[derive(Debug, Default)]
pub struct InMemoryResumeStore {
    entries: Mutex<Vec<LogEntry>>,
}

impl InMemoryResumeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding earlier records.
    #[must_use]
    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// All records, in append order.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ResumeStore for InMemoryResumeStore {
    async fn load(&self) -> Result<ResumeSnapshot, MlchainError> {
        let mut snapshot = ResumeSnapshot::new();
        for entry in self.entries.lock().iter().cloned() {
            snapshot.apply(entry);
        }
        Ok(snapshot)
    }

    async fn append(&self, entry: LogEntry) -> Result<(), MlchainError> {
        self.entries.lock().push(entry);
        Ok(())
    }
}
