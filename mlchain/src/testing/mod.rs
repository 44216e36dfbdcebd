//! Testing utilities.
//!
//! This module provides:
//! - A scripted in-memory remote platform
//! - Assertions over run results

mod assertions;
mod mocks;

pub use assertions::{
    assert_run_failed, assert_run_succeeded, assert_stages_of_kind, assert_status_count,
};
pub use mocks::{
    default_payload, CreatedResource, FailurePredicate, FetchFn, ScriptedFailure,
    ScriptedRemoteClient, DEFAULT_PREDICTION_ROWS,
};
