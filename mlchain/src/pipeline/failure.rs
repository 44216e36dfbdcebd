//! Failure records collected during a run.
//!
//! A failed stage never stops unrelated branches; its dependents are marked
//! failed with an upstream cause and everything else keeps running.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::StageId;
use crate::errors::{ErrorKind, StageError};
use crate::utils::unix_timestamp;

/// Record of a stage failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// The failed stage.
    pub stage_id: StageId,
    /// Failure category.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
    /// Unix timestamp of the failure.
    pub timestamp: f64,
}

impl FailureRecord {
    /// Creates a record for a stage error, stamped with the current time.
    #[must_use]
    pub fn new(stage_id: StageId, error: &StageError) -> Self {
        Self {
            stage_id,
            kind: error.kind,
            message: error.message.clone(),
            timestamp: unix_timestamp(),
        }
    }

    /// Returns true if the stage failed only because an input failed.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        self.kind == ErrorKind::UpstreamFailed
    }
}

/// Summary of failures during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureSummary {
    /// Total number of stages.
    pub total_stages: usize,
    /// Stages that ended satisfied, created or resumed.
    pub completed_stages: usize,
    /// Stages that ended failed.
    pub failed_stages: usize,
    /// Failure records in the order they happened.
    pub failures: Vec<FailureRecord>,
}

impl FailureSummary {
    /// Creates an empty summary.
    #[must_use]
    pub fn new(total_stages: usize) -> Self {
        Self {
            total_stages,
            ..Self::default()
        }
    }

    /// Adds a failure.
    pub fn record(&mut self, record: FailureRecord) {
        self.failed_stages += 1;
        self.failures.push(record);
    }

    /// Returns the fraction of stages that completed.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_stages == 0 {
            return 0.0;
        }
        self.completed_stages as f64 / self.total_stages as f64
    }

    /// Returns true if any failures occurred.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Failures that originated at the stage itself, not upstream.
    pub fn root_causes(&self) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(|f| !f.is_upstream())
    }

    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("total_stages".to_string(), serde_json::json!(self.total_stages));
        map.insert("completed_stages".to_string(), serde_json::json!(self.completed_stages));
        map.insert("failed_stages".to_string(), serde_json::json!(self.failed_stages));
        map.insert("success_rate".to_string(), serde_json::json!(self.success_rate()));
        map.insert("failures".to_string(), serde_json::json!(self.failures));
        map
    }
}
