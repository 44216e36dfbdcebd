//! Logging setup and timing helpers.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::errors::MlchainError;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "mlchain=info";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per event.
    Json,
}

/// Installs a global `tracing` subscriber.
///
/// Filtering follows `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
///
/// # Errors
///
/// Returns [`MlchainError::Internal`] if a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), MlchainError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(false)).try_init(),
    };
    result.map_err(|e| MlchainError::Internal(format!("tracing already initialised: {e}")))
}

/// Wall-clock timer for stages and runs.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Starts a timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed whole milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
