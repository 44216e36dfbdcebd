//! Error types for the mlchain orchestration engine.
//!
//! Pipeline-level failures (a request that cannot be expanded, an unreadable
//! resume store, a concurrent run) are returned as [`MlchainError`] and abort
//! the run before any stage executes. Stage-level failures are data: they are
//! recorded on the failing stage as a [`StageError`] and reported in the run
//! result, never returned as `Err`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for mlchain operations.
#[derive(Debug, Error)]
pub enum MlchainError {
    /// The pipeline request cannot be expanded into a graph.
    #[error("{0}")]
    MalformedRequest(#[from] MalformedRequestError),

    /// The resume store could not be replayed.
    #[error("{0}")]
    ResumeStoreCorrupt(#[from] ResumeStoreCorruptError),

    /// Another run holds the resume store.
    #[error("{0}")]
    ConcurrentRun(#[from] ConcurrentRunError),

    /// Transient errors exhausted the retry budget.
    #[error("{0}")]
    PollExhausted(#[from] PollExhaustedError),

    /// The remote platform reported a resource failure.
    #[error("{0}")]
    RemoteFailure(#[from] RemoteFailure),

    /// Partition outputs did not line up with their row ranges.
    #[error("{0}")]
    PartitionMismatch(#[from] PartitionMismatchError),

    /// A stage or the whole pipeline ran past its deadline.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    /// The run was cancelled.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for MlchainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl MlchainError {
    /// Returns the stage-level error kind this error maps onto.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedRequest(_) => ErrorKind::MalformedRequest,
            Self::ResumeStoreCorrupt(_) | Self::ConcurrentRun(_) | Self::Io(_) => {
                ErrorKind::ResumeStore
            }
            Self::PollExhausted(_) => ErrorKind::PollExhausted,
            Self::RemoteFailure(_) => ErrorKind::RemoteFailure,
            Self::PartitionMismatch(_) => ErrorKind::PartitionMismatch,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Serialization(_) => ErrorKind::InvalidPayload,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Diagnostic metadata attached to pipeline-level errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "MLCHAIN-REQUEST-NO_MODEL").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("summary".to_string(), serde_json::json!(self.summary));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        if !self.context.is_empty() {
            map.insert("context".to_string(), serde_json::json!(self.context));
        }
        map
    }
}

/// Error raised when a request cannot be turned into a pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Malformed pipeline request: {message}")]
pub struct MalformedRequestError {
    /// The error message.
    pub message: String,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl MalformedRequestError {
    /// Creates a new malformed request error with a diagnostic code.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error_info: ErrorInfo::new(code, message.clone()),
            message,
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.error_info = self.error_info.with_fix_hint(hint);
        self
    }

    /// Returns the diagnostic code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.error_info.code
    }
}

/// Error raised when the execution log cannot be replayed.
#[derive(Debug, Clone, Error)]
#[error("Resume store '{}' is corrupt at line {line}: {reason}", path.display())]
pub struct ResumeStoreCorruptError {
    /// Path of the log file.
    pub path: PathBuf,
    /// 1-based line number of the first unreadable record.
    pub line: usize,
    /// What was wrong with the record.
    pub reason: String,
}

impl ResumeStoreCorruptError {
    /// Creates a new corrupt store error.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    /// Diagnostic info for this error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::new("MLCHAIN-RESUME-CORRUPT", self.to_string())
            .with_fix_hint("Re-run with a fresh resume store to discard the unreadable log.")
            .with_context_entry("line", self.line.to_string())
    }
}

/// Error raised when another run holds the resume store lock.
#[derive(Debug, Clone, Error)]
#[error("Another run holds the resume store lock '{}'", lock_path.display())]
pub struct ConcurrentRunError {
    /// The lock file that already exists.
    pub lock_path: PathBuf,
    /// Lock holder description read from the lock file, if readable.
    pub holder: Option<String>,
}

impl ConcurrentRunError {
    /// Creates a new concurrent run error.
    #[must_use]
    pub fn new(lock_path: impl Into<PathBuf>, holder: Option<String>) -> Self {
        Self {
            lock_path: lock_path.into(),
            holder,
        }
    }

    /// Diagnostic info for this error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let info = ErrorInfo::new("MLCHAIN-RESUME-LOCKED", self.to_string()).with_fix_hint(
            "Wait for the other run to finish, or delete the lock file if no run is active.",
        );
        match self.holder {
            Some(ref holder) => info.with_context_entry("holder", holder.clone()),
            None => info,
        }
    }
}

/// Error raised when transient errors exhaust the retry budget.
#[derive(Debug, Clone, Error)]
#[error("Gave up on '{target}' after {attempts} transient errors: {last_error}")]
pub struct PollExhaustedError {
    /// The remote id (or stage id when no remote id exists yet).
    pub target: String,
    /// Number of transient errors observed.
    pub attempts: u32,
    /// The last transient error message.
    pub last_error: String,
}

impl PollExhaustedError {
    /// Creates a new poll exhausted error.
    #[must_use]
    pub fn new(target: impl Into<String>, attempts: u32, last_error: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attempts,
            last_error: last_error.into(),
        }
    }
}

/// The remote platform reported that a resource failed to build.
#[derive(Debug, Clone, Error)]
#[error("Remote resource '{remote_id}' failed: {detail}")]
pub struct RemoteFailure {
    /// The failed resource.
    pub remote_id: String,
    /// Platform-reported detail.
    pub detail: String,
}

impl RemoteFailure {
    /// Creates a new remote failure.
    #[must_use]
    pub fn new(remote_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            detail: detail.into(),
        }
    }
}

/// What part of a partition's output failed to line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchField {
    /// The number of rows the partition produced.
    Rows,
    /// The first row of the partition's range.
    StartRow,
}

impl fmt::Display for MismatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rows => f.write_str("rows"),
            Self::StartRow => f.write_str("start row"),
        }
    }
}

/// Error raised when partition outputs do not tile the predicted rows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Partition {partition} mismatch: expected {expected} {field}, got {actual}")]
pub struct PartitionMismatchError {
    /// Index of the offending partition (or ensemble member).
    pub partition: usize,
    /// What was compared.
    pub field: MismatchField,
    /// The expected value.
    pub expected: usize,
    /// The value found.
    pub actual: usize,
}

impl PartitionMismatchError {
    /// A partition whose output row count differs from its range.
    #[must_use]
    pub fn new(partition: usize, expected: usize, actual: usize) -> Self {
        Self {
            partition,
            field: MismatchField::Rows,
            expected,
            actual,
        }
    }

    /// A partition whose range leaves a gap or overlaps the previous one.
    #[must_use]
    pub fn misplaced(partition: usize, expected_start: usize, actual_start: usize) -> Self {
        Self {
            partition,
            field: MismatchField::StartRow,
            expected: expected_start,
            actual: actual_start,
        }
    }
}

/// Error raised when a deadline is exceeded.
#[derive(Debug, Clone, Error)]
#[error("{scope} deadline of {seconds}s exceeded")]
pub struct TimeoutError {
    /// Which deadline fired ("stage" or "pipeline").
    pub scope: String,
    /// The configured deadline.
    pub seconds: f64,
}

impl TimeoutError {
    /// A per-stage poll deadline.
    #[must_use]
    pub fn stage(seconds: f64) -> Self {
        Self {
            scope: "stage".to_string(),
            seconds,
        }
    }

    /// The overall pipeline deadline.
    #[must_use]
    pub fn pipeline(seconds: f64) -> Self {
        Self {
            scope: "pipeline".to_string(),
            seconds,
        }
    }
}

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The stage could not be built from its inputs.
    MalformedRequest,
    /// Transient errors exhausted the retry budget.
    PollExhausted,
    /// The platform reported the resource failed.
    RemoteFailure,
    /// Partition or member outputs did not line up.
    PartitionMismatch,
    /// A deadline was exceeded.
    Timeout,
    /// The run was cancelled while the stage was in flight.
    Cancelled,
    /// An input stage failed, so this stage never ran.
    UpstreamFailed,
    /// A fetched payload could not be interpreted.
    InvalidPayload,
    /// The execution log could not be written.
    ResumeStore,
    /// An unexpected internal error.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MalformedRequest => "MalformedRequestError",
            Self::PollExhausted => "PollExhaustedError",
            Self::RemoteFailure => "RemoteFailure",
            Self::PartitionMismatch => "PartitionMismatchError",
            Self::Timeout => "TimeoutError",
            Self::Cancelled => "Cancelled",
            Self::UpstreamFailed => "UpstreamFailed",
            Self::InvalidPayload => "InvalidPayload",
            Self::ResumeStore => "ResumeStoreError",
            Self::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

/// A failure recorded against a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    /// The failure classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A failure caused by a failed input stage.
    #[must_use]
    pub fn upstream(failed_input: &str) -> Self {
        Self::new(
            ErrorKind::UpstreamFailed,
            format!("input stage '{failed_input}' did not succeed"),
        )
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<MlchainError> for StageError {
    fn from(err: MlchainError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<PartitionMismatchError> for StageError {
    fn from(err: PartitionMismatchError) -> Self {
        Self::new(ErrorKind::PartitionMismatch, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "model-abc");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"model-abc".to_string()));

        let dict = info.to_dict();
        assert_eq!(dict.get("code").unwrap(), "TEST-001");
        assert!(dict.contains_key("context"));
    }

    #[test]
    fn test_malformed_request_code() {
        let err = MalformedRequestError::new("MLCHAIN-REQUEST-NO_MODEL", "evaluation needs a model")
            .with_fix_hint("Provide training data or an existing model.");

        assert_eq!(err.code(), "MLCHAIN-REQUEST-NO_MODEL");
        assert!(err.to_string().contains("evaluation needs a model"));
        assert!(err.error_info.fix_hint.is_some());
    }

    #[test]
    fn test_error_kind_mapping() {
        let err: MlchainError = PartitionMismatchError::new(1, 8, 7).into();
        assert_eq!(err.kind(), ErrorKind::PartitionMismatch);

        let err: MlchainError = ConcurrentRunError::new("/tmp/x.lock", None).into();
        assert_eq!(err.kind(), ErrorKind::ResumeStore);

        let err: MlchainError = TimeoutError::stage(5.0).into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("stage deadline of 5s"));
    }

    #[test]
    fn test_stage_error_from_mlchain_error() {
        let err: MlchainError = RemoteFailure::new("model/1", "bad objective").into();
        let stage_err = StageError::from(err);

        assert_eq!(stage_err.kind, ErrorKind::RemoteFailure);
        assert!(stage_err.message.contains("bad objective"));
        assert_eq!(
            stage_err.to_string(),
            "RemoteFailure: Remote resource 'model/1' failed: bad objective"
        );
    }

    #[test]
    fn test_error_kind_serialize() {
        let json = serde_json::to_string(&ErrorKind::PollExhausted).unwrap();
        assert_eq!(json, r#""poll_exhausted""#);
    }

    #[test]
    fn test_corrupt_error_info() {
        let err = ResumeStoreCorruptError::new("/tmp/log", 3, "expected value");
        let info = err.error_info();
        assert_eq!(info.code, "MLCHAIN-RESUME-CORRUPT");
        assert_eq!(info.context.get("line"), Some(&"3".to_string()));
    }
}
