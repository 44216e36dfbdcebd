//! Timestamp helpers.

use chrono::{DateTime, SecondsFormat, Utc};

/// A UTC timestamp.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time as ISO 8601 with microseconds,
/// e.g. `2024-05-01T12:00:00.123456+00:00`.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Returns the current time as fractional seconds since the Unix epoch.
#[must_use]
pub fn unix_timestamp() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Parses an ISO 8601 / RFC 3339 timestamp as written by [`iso_timestamp`].
pub fn parse_timestamp(input: &str) -> Result<Timestamp, chrono::ParseError> {
    DateTime::parse_from_rfc3339(input.trim()).map(|dt| dt.with_timezone(&Utc))
}
