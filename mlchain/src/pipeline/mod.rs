//! Pipeline requests and their expansion into stage graphs.
//!
//! This module provides:
//! - Declarative pipeline requests
//! - Deterministic stage ids
//! - The pipeline builder
//! - Failure records collected during execution

mod builder;
mod failure;
mod fingerprint;
mod graph;
mod request;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use failure::{FailureRecord, FailureSummary};
pub use fingerprint::stage_id;
pub use graph::{PipelineGraph, Target};
pub use request::{DataInput, Goal, ModelInput, ModelRecipe, PartitionPlan, PipelineRequest};

/// Expands a request into a pipeline graph.
///
/// # Errors
///
/// Returns [`MalformedRequestError`](crate::errors::MalformedRequestError)
/// if a goal cannot be produced from the request's inputs.
pub fn build(request: &PipelineRequest) -> Result<PipelineGraph, crate::errors::MalformedRequestError> {
    PipelineBuilder::new(request).build()
}
