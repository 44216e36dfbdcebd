//! Timestamp and identifier helpers.

pub mod timestamps;

pub use timestamps::{iso_timestamp, parse_timestamp, unix_timestamp, Timestamp};

use uuid::Uuid;

/// Generates a run id. Version 7 ids sort by creation time.
#[must_use]
pub fn generate_run_id() -> Uuid {
    Uuid::now_v7()
}
