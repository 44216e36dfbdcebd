//! Core domain model types for mlchain.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Stage status and kind enums
//! - Remote resource kinds and identifiers
//! - Stages and their typed parameters

mod resource;
mod stage;
mod status;

pub use resource::{RemoteId, ResourceKind};
pub use stage::{CombineOp, DataRole, Recipe, Sampling, Stage, StageId, StageParams};
pub use status::{StageKind, StageStatus};
