//! Assertions over run results.

use crate::core::{StageKind, StageStatus};
use crate::scheduler::RunResult;

/// Asserts that every target of the run succeeded.
pub fn assert_run_succeeded(result: &RunResult) {
    assert!(
        result.success,
        "Expected a successful run, failures: {:?}",
        result
            .failures
            .failures
            .iter()
            .map(|f| format!("{} {}: {}", f.stage_id, f.kind, f.message))
            .collect::<Vec<_>>()
    );
}

/// Asserts that the run failed.
pub fn assert_run_failed(result: &RunResult) {
    assert!(!result.success, "Expected the run to fail, but every target succeeded");
}

/// Asserts that every stage of `kind` ended with `expected`.
pub fn assert_stages_of_kind(result: &RunResult, kind: StageKind, expected: StageStatus) {
    let mismatched: Vec<_> = result
        .stages
        .iter()
        .filter(|s| s.kind == kind && s.status != expected)
        .map(|s| (s.stage_id.to_string(), s.status))
        .collect();
    assert!(
        mismatched.is_empty(),
        "Expected every {kind} stage to be {expected}, got {mismatched:?}"
    );
}

/// Asserts how many stages ended with `expected`.
pub fn assert_status_count(result: &RunResult, expected: StageStatus, count: usize) {
    let actual = result.stages_with(expected).count();
    assert_eq!(
        actual, count,
        "Expected {count} stages with status {expected}, got {actual}"
    );
}
