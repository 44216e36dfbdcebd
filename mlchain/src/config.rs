//! Run configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Environment variables override file values:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `MLCHAIN_CONCURRENCY` | `concurrency` |
//! | `MLCHAIN_RETRY_BUDGET` | `transient_retry_budget` |
//! | `MLCHAIN_LOG_PATH` | `log_path` |
//! | `MLCHAIN_FRESH` | `resume_mode` (`1`/`true` for a fresh run) |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{MalformedRequestError, MlchainError};
use crate::poller::{BackoffConfig, PollPolicy};
use crate::resume::ResumeMode;

/// Settings for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum stages in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Delay curve between polls.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Consecutive transient errors tolerated per remote call sequence.
    #[serde(default = "default_retry_budget")]
    pub transient_retry_budget: u32,
    /// Deadline for the whole run, in seconds.
    #[serde(default)]
    pub pipeline_timeout_secs: Option<f64>,
    /// Deadline for polling one stage, in seconds.
    #[serde(default)]
    pub stage_timeout_secs: Option<f64>,
    /// Whether to resume from the execution log.
    #[serde(default)]
    pub resume_mode: ResumeMode,
    /// Location of the execution log.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

fn default_concurrency() -> usize {
    4
}

fn default_retry_budget() -> u32 {
    5
}

fn default_log_path() -> PathBuf {
    PathBuf::from(".mlchain").join("execution.log")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            backoff: BackoffConfig::default(),
            transient_retry_budget: default_retry_budget(),
            pipeline_timeout_secs: None,
            stage_timeout_secs: None,
            resume_mode: ResumeMode::default(),
            log_path: default_log_path(),
        }
    }
}

impl RunConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency ceiling.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the backoff curve.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the transient retry budget.
    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.transient_retry_budget = budget;
        self
    }

    /// Sets the overall deadline.
    #[must_use]
    pub fn with_pipeline_timeout(mut self, seconds: f64) -> Self {
        self.pipeline_timeout_secs = Some(seconds);
        self
    }

    /// Sets the per-stage deadline.
    #[must_use]
    pub fn with_stage_timeout(mut self, seconds: f64) -> Self {
        self.stage_timeout_secs = Some(seconds);
        self
    }

    /// Sets the resume mode.
    #[must_use]
    pub fn with_resume_mode(mut self, mode: ResumeMode) -> Self {
        self.resume_mode = mode;
        self
    }

    /// Sets the execution log path.
    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MlchainError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Applies `MLCHAIN_*` environment overrides.
    pub fn apply_env(self) -> Result<Self, MalformedRequestError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, MalformedRequestError> {
        if let Some(value) = lookup("MLCHAIN_CONCURRENCY") {
            self.concurrency = parse_env("MLCHAIN_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("MLCHAIN_RETRY_BUDGET") {
            self.transient_retry_budget = parse_env("MLCHAIN_RETRY_BUDGET", &value)?;
        }
        if let Some(value) = lookup("MLCHAIN_LOG_PATH") {
            self.log_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("MLCHAIN_FRESH") {
            self.resume_mode = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => ResumeMode::Fresh,
                "0" | "false" | "no" | "" => ResumeMode::ResumeIfPossible,
                other => {
                    return Err(MalformedRequestError::new(
                        "MLCHAIN-CONFIG-ENV",
                        format!("MLCHAIN_FRESH must be a boolean, got '{other}'"),
                    ))
                }
            };
        }
        Ok(self)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), MalformedRequestError> {
        let invalid = |message: String| Err(MalformedRequestError::new("MLCHAIN-CONFIG-INVALID", message));

        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".to_string());
        }
        if self.backoff.max_ms < self.backoff.initial_ms {
            return invalid(format!(
                "backoff cap {}ms is below the initial delay {}ms",
                self.backoff.max_ms, self.backoff.initial_ms
            ));
        }
        if !self.backoff.multiplier.is_finite() || self.backoff.multiplier < 1.0 {
            return invalid(format!(
                "backoff multiplier must be at least 1.0, got {}",
                self.backoff.multiplier
            ));
        }
        for (name, value) in [
            ("pipeline_timeout_secs", self.pipeline_timeout_secs),
            ("stage_timeout_secs", self.stage_timeout_secs),
        ] {
            if let Some(seconds) = value {
                if !seconds.is_finite() || seconds <= 0.0 {
                    return invalid(format!("{name} must be a positive number of seconds, got {seconds}"));
                }
            }
        }
        Ok(())
    }

    /// The overall deadline.
    #[must_use]
    pub fn pipeline_timeout(&self) -> Option<Duration> {
        self.pipeline_timeout_secs
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }

    /// The poller settings derived from this config.
    #[must_use]
    pub fn poll_policy(&self) -> PollPolicy {
        let policy = PollPolicy::default()
            .with_backoff(self.backoff)
            .with_transient_budget(self.transient_retry_budget);
        match self.stage_timeout_secs.and_then(|s| Duration::try_from_secs_f64(s).ok()) {
            Some(timeout) => policy.with_stage_timeout(timeout),
            None => policy,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, MalformedRequestError> {
    value.trim().parse().map_err(|_| {
        MalformedRequestError::new(
            "MLCHAIN-CONFIG-ENV",
            format!("{key} has an invalid value '{value}'"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.transient_retry_budget, 5);
        assert_eq!(config.resume_mode, ResumeMode::ResumeIfPossible);
        assert_eq!(config.log_path, PathBuf::from(".mlchain/execution.log"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_is_default() {
        let config: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mlchain.json");
        std::fs::write(
            &path,
            r#"{"concurrency": 8, "backoff": {"initial_ms": 250}, "resume_mode": "fresh", "stage_timeout_secs": 90}"#,
        )
        .unwrap();

        let config = RunConfig::from_file(&path).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.backoff.initial_ms, 250);
        assert_eq!(config.backoff.max_ms, 30_000);
        assert_eq!(config.resume_mode, ResumeMode::Fresh);
        assert_eq!(config.poll_policy().stage_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MLCHAIN_CONCURRENCY", "2"),
            ("MLCHAIN_RETRY_BUDGET", "9"),
            ("MLCHAIN_LOG_PATH", "/tmp/run.log"),
            ("MLCHAIN_FRESH", "true"),
        ]
        .into_iter()
        .collect();

        let config = RunConfig::default()
            .apply_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.transient_retry_budget, 9);
        assert_eq!(config.log_path, PathBuf::from("/tmp/run.log"));
        assert_eq!(config.resume_mode, ResumeMode::Fresh);
    }

    #[test]
    fn test_bad_env_value() {
        let err = RunConfig::default()
            .apply_overrides(|key| (key == "MLCHAIN_CONCURRENCY").then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), "MLCHAIN-CONFIG-ENV");
    }

    #[test]
    fn test_validation() {
        assert!(RunConfig::default().with_concurrency(0).validate().is_err());
        assert!(RunConfig::default().with_stage_timeout(-1.0).validate().is_err());
        assert!(RunConfig::default()
            .with_backoff(BackoffConfig::new().with_initial_ms(100).with_max_ms(10))
            .validate()
            .is_err());
        assert!(RunConfig::default().with_pipeline_timeout(60.0).validate().is_ok());
    }
}
