//! Bounded-concurrency scheduling of pipeline stages.
//!
//! The executor owns a [`SchedulerState`] and a pool of spawned workers. A
//! stage is dispatched once every input is satisfied and a slot under the
//! concurrency ceiling is free; ties go to the earliest inserted stage. A
//! failed stage fails its transitive dependents and nothing else.

mod executor;
mod result;
mod state;
mod worker;

pub use executor::PipelineExecutor;
pub use result::{RunResult, StageReport, TargetResult};
pub use state::{Dispatch, Presatisfied, SchedulerState};
