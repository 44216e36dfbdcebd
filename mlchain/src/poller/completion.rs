//! The poll state machine and the poller driving it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::BackoffConfig;
use crate::cancellation::CancellationToken;
use crate::client::{RemoteClient, RemoteError, RemoteState, RemoteStatus};
use crate::core::{RemoteId, ResourceKind, StageId};
use crate::errors::{ErrorKind, MlchainError, PollExhaustedError, RemoteFailure, StageError, TimeoutError};

/// Retry and deadline settings for remote calls.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Delay curve between polls and between transient retries.
    pub backoff: BackoffConfig,
    /// Consecutive transient errors tolerated before giving up.
    pub transient_budget: u32,
    /// Deadline for one stage's polling.
    pub stage_timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            transient_budget: 5,
            stage_timeout: None,
        }
    }
}

impl PollPolicy {
    /// Sets the backoff curve.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the transient error budget.
    #[must_use]
    pub fn with_transient_budget(mut self, budget: u32) -> Self {
        self.transient_budget = budget;
        self
    }

    /// Sets the per-stage deadline.
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }
}

/// How polling a resource ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The resource is ready.
    Ready,
    /// The resource failed, polling gave up, or the deadline passed.
    Failed(StageError),
    /// Polling stopped on cancellation; the resource may still finish remotely.
    Abandoned,
}

/// Where an in-flight resource is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    /// Created, not yet polled.
    Issued,
    /// Polled at least once and still building.
    Polling,
    /// Finished; no further polls.
    Terminal(PollOutcome),
}

/// State machine for one in-flight remote resource.
#[derive(Debug, Clone)]
pub struct InFlight {
    stage_id: StageId,
    remote_id: RemoteId,
    state: PollState,
    polls: u32,
    transient_errors: u32,
}

impl InFlight {
    /// Starts tracking an issued resource.
    #[must_use]
    pub fn new(stage_id: StageId, remote_id: RemoteId) -> Self {
        Self {
            stage_id,
            remote_id,
            state: PollState::Issued,
            polls: 0,
            transient_errors: 0,
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Status reads observed so far.
    #[must_use]
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// The stage being tracked.
    #[must_use]
    pub fn stage_id(&self) -> &StageId {
        &self.stage_id
    }

    /// Applies one status reading. Terminal states absorb further readings.
    ///
    /// A successful reading resets the transient error count; the
    /// `budget + 1`-th consecutive transient error ends polling.
    pub fn observe(&mut self, reading: Result<RemoteStatus, RemoteError>, budget: u32) -> &PollState {
        if matches!(self.state, PollState::Terminal(_)) {
            return &self.state;
        }
        self.polls += 1;

        self.state = match reading {
            Ok(status) => {
                self.transient_errors = 0;
                match status.state {
                    RemoteState::Pending => PollState::Polling,
                    RemoteState::Ready => PollState::Terminal(PollOutcome::Ready),
                    RemoteState::Failed => {
                        let detail = status.detail.unwrap_or_else(|| "no detail reported".to_string());
                        PollState::Terminal(PollOutcome::Failed(
                            MlchainError::from(RemoteFailure::new(self.remote_id.as_str(), detail)).into(),
                        ))
                    }
                }
            }
            Err(e) if e.is_transient() => {
                self.transient_errors += 1;
                if self.transient_errors > budget {
                    PollState::Terminal(PollOutcome::Failed(
                        MlchainError::from(PollExhaustedError::new(
                            self.remote_id.as_str(),
                            self.transient_errors,
                            e.to_string(),
                        ))
                        .into(),
                    ))
                } else {
                    PollState::Polling
                }
            }
            Err(e) => PollState::Terminal(PollOutcome::Failed(
                MlchainError::from(RemoteFailure::new(self.remote_id.as_str(), e.to_string())).into(),
            )),
        };
        &self.state
    }

    /// Stops tracking without a verdict.
    pub fn abandon(&mut self) {
        if !matches!(self.state, PollState::Terminal(_)) {
            self.state = PollState::Terminal(PollOutcome::Abandoned);
        }
    }
}

fn cancelled_error(cancel: &CancellationToken) -> StageError {
    StageError::new(
        ErrorKind::Cancelled,
        cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
    )
}

/// Issues, polls and fetches remote resources under a [`PollPolicy`].
#[derive(Clone)]
pub struct CompletionPoller {
    client: Arc<dyn RemoteClient>,
    policy: PollPolicy,
}

impl std::fmt::Debug for CompletionPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionPoller")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CompletionPoller {
    /// Creates a poller over a client.
    #[must_use]
    pub fn new(client: Arc<dyn RemoteClient>, policy: PollPolicy) -> Self {
        Self { client, policy }
    }

    /// The poller's policy.
    #[must_use]
    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Calls `create`, retrying transient errors within the budget.
    pub async fn issue(
        &self,
        stage_id: &StageId,
        kind: ResourceKind,
        params: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<RemoteId, StageError> {
        self.retry_transient(stage_id.as_str(), cancel, || {
            self.client.create(kind, params.clone())
        })
        .await
    }

    /// Calls `fetch`, retrying transient errors within the budget.
    pub async fn fetch(
        &self,
        remote_id: &RemoteId,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        self.retry_transient(remote_id.as_str(), cancel, || self.client.fetch(remote_id))
            .await
    }

    /// Polls `remote_id` until it is terminal, cancellation, or the stage deadline.
    pub async fn wait(
        &self,
        stage_id: &StageId,
        remote_id: &RemoteId,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let polling = self.poll_until_terminal(stage_id, remote_id, cancel);
        let Some(limit) = self.policy.stage_timeout else {
            return polling.await;
        };

        match tokio::time::timeout(limit, polling).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    stage_id = %stage_id,
                    remote_id = %remote_id,
                    timeout_ms = limit.as_millis() as u64,
                    "Stage deadline exceeded"
                );
                PollOutcome::Failed(MlchainError::from(TimeoutError::stage(limit.as_secs_f64())).into())
            }
        }
    }

    async fn poll_until_terminal(
        &self,
        stage_id: &StageId,
        remote_id: &RemoteId,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let mut in_flight = InFlight::new(stage_id.clone(), remote_id.clone());
        loop {
            if cancel.is_cancelled() {
                in_flight.abandon();
                return PollOutcome::Abandoned;
            }

            let reading = self.client.status(remote_id).await;
            if let Err(ref e) = reading {
                tracing::warn!(stage_id = %stage_id, remote_id = %remote_id, error = %e, "Status read failed");
            }
            if let PollState::Terminal(outcome) = in_flight.observe(reading, self.policy.transient_budget) {
                return outcome.clone();
            }

            let delay = self.policy.backoff.delay(in_flight.polls() - 1);
            tracing::debug!(
                stage_id = %stage_id,
                remote_id = %remote_id,
                attempt = in_flight.polls(),
                delay_ms = delay.as_millis() as u64,
                "Resource not ready"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    in_flight.abandon();
                    return PollOutcome::Abandoned;
                }
            }
        }
    }

    async fn retry_transient<T, F, Fut>(
        &self,
        target: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled_error(cancel));
            }

            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures > self.policy.transient_budget {
                        return Err(MlchainError::from(PollExhaustedError::new(target, failures, e.to_string())).into());
                    }
                    let delay = self.policy.backoff.delay(failures - 1);
                    tracing::warn!(
                        target_id = target,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient remote error, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(cancelled_error(cancel)),
                    }
                }
                Err(e) => {
                    return Err(MlchainError::from(RemoteFailure::new(target, e.to_string())).into());
                }
            }
        }
    }
}
