//! # mlchain
//!
//! Resumable orchestration of multi-stage pipelines of remote machine-learning
//! resources.
//!
//! mlchain turns a declarative request into a graph of stages (sources,
//! datasets, models, evaluations, batch predictions) and runs it against a
//! remote platform with:
//!
//! - **Deterministic stage ids**: the same request always yields the same graph
//! - **Resumability**: completed stages are logged durably and skipped on re-run
//! - **Bounded concurrency**: at most N stages in flight, earliest stage first
//! - **Failure isolation**: a failed stage fails only what depends on it
//! - **Local combining**: ensemble votes, partition stitching and
//!   cross-validation summaries are computed locally
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mlchain::prelude::*;
//!
//! let request = PipelineRequest::new()
//!     .with_training(DataInput::Raw { path: "train.csv".into() })
//!     .with_test(DataInput::Raw { path: "test.csv".into() })
//!     .with_goal(Goal::Predictions);
//!
//! let executor = PipelineExecutor::new(client, RunConfig::default());
//! let result = executor.run_request(&request).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod client;
pub mod combiner;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod poller;
pub mod registry;
pub mod resume;
pub mod scheduler;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::client::{RemoteClient, RemoteError, RemoteState, RemoteStatus};
    pub use crate::combiner::{CombineMethod, CombinedArtifact, CrossValidationSummary, RowPrediction};
    pub use crate::config::RunConfig;
    pub use crate::core::{RemoteId, ResourceKind, StageId, StageKind, StageStatus};
    pub use crate::errors::{ErrorKind, MlchainError, StageError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        build, DataInput, Goal, ModelInput, ModelRecipe, PartitionPlan, PipelineBuilder, PipelineGraph,
        PipelineRequest,
    };
    pub use crate::poller::{BackoffConfig, JitterStrategy};
    pub use crate::resume::{FileResumeStore, InMemoryResumeStore, ResumeMode, ResumeStore};
    pub use crate::scheduler::{PipelineExecutor, RunResult, TargetResult};
    pub use crate::utils::{generate_run_id, iso_timestamp, Timestamp};
}
