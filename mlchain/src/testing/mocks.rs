//! A scripted in-memory remote platform.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{RemoteClient, RemoteError, RemoteStatus};
use crate::core::{RemoteId, ResourceKind};

/// Rows in a default prediction payload when the create call names no count.
pub const DEFAULT_PREDICTION_ROWS: u64 = 4;

/// A resource created through a [`ScriptedRemoteClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedResource {
    /// The assigned id.
    pub remote_id: RemoteId,
    /// The resource kind.
    pub kind: ResourceKind,
    /// The create parameters as received.
    pub params: serde_json::Value,
}

/// How a scripted resource fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// The create call is refused.
    Rejected,
    /// The resource is created but reports a failed build.
    Failed,
}

/// Decides whether a create call fails.
pub type FailurePredicate = dyn Fn(ResourceKind, &serde_json::Value) -> bool + Send + Sync;

/// Produces the payload returned by `fetch`. The resource is `None` for ids
/// the client never created.
pub type FetchFn = dyn Fn(&RemoteId, Option<&CreatedResource>) -> serde_json::Value + Send + Sync;

#[derive(Debug, Default)]
struct ScriptState {
    next_id: HashMap<ResourceKind, usize>,
    created: Vec<CreatedResource>,
    polls: HashMap<RemoteId, u32>,
    doomed: HashSet<RemoteId>,
    building: HashSet<RemoteId>,
    peak_building: usize,
    status_calls: usize,
    fetch_calls: usize,
}

/// In-memory [`RemoteClient`] with scripted behaviour.
///
/// Ids are assigned per kind in creation order (`model/1`, `model/2`, ...).
/// A resource reports pending for a configurable number of polls, then ready.
/// Ids the client never created are treated as pre-existing and ready.
pub struct ScriptedRemoteClient {
    polls_before_ready: u32,
    latency: Duration,
    failures: Vec<(ScriptedFailure, Arc<FailurePredicate>)>,
    transient_create_errors: AtomicU32,
    transient_status_errors: AtomicU32,
    fetch: Option<Arc<FetchFn>>,
    state: Mutex<ScriptState>,
}

impl std::fmt::Debug for ScriptedRemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedRemoteClient")
            .field("polls_before_ready", &self.polls_before_ready)
            .field("latency", &self.latency)
            .field("failures", &self.failures.len())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Default for ScriptedRemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRemoteClient {
    /// A client whose resources are ready on the first poll.
    #[must_use]
    pub fn new() -> Self {
        Self {
            polls_before_ready: 0,
            latency: Duration::ZERO,
            failures: Vec::new(),
            transient_create_errors: AtomicU32::new(0),
            transient_status_errors: AtomicU32::new(0),
            fetch: None,
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Resources report pending for `polls` status reads before ready.
    #[must_use]
    pub fn with_polls_before_ready(mut self, polls: u32) -> Self {
        self.polls_before_ready = polls;
        self
    }

    /// Every create and status call takes `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every resource of `kind` fails.
    #[must_use]
    pub fn failing_kind(self, kind: ResourceKind, failure: ScriptedFailure) -> Self {
        self.failing_when(failure, move |k, _| k == kind)
    }

    /// Resources matching `predicate` fail.
    #[must_use]
    pub fn failing_when(
        mut self,
        failure: ScriptedFailure,
        predicate: impl Fn(ResourceKind, &serde_json::Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        let predicate: Arc<FailurePredicate> = Arc::new(predicate);
        self.failures.push((failure, predicate));
        self
    }

    /// The next `count` create calls time out.
    #[must_use]
    pub fn with_transient_create_errors(self, count: u32) -> Self {
        self.transient_create_errors.store(count, Ordering::SeqCst);
        self
    }

    /// The next `count` status calls fail with a transport error.
    #[must_use]
    pub fn with_transient_status_errors(self, count: u32) -> Self {
        self.transient_status_errors.store(count, Ordering::SeqCst);
        self
    }

    /// Overrides the payloads returned by `fetch`.
    #[must_use]
    pub fn with_fetch(
        mut self,
        fetch: impl Fn(&RemoteId, Option<&CreatedResource>) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        let fetch: Arc<FetchFn> = Arc::new(fetch);
        self.fetch = Some(fetch);
        self
    }

    /// Number of successful create calls.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.state.lock().created.len()
    }

    /// Number of successful create calls for `kind`.
    #[must_use]
    pub fn creates_of(&self, kind: ResourceKind) -> usize {
        self.state.lock().created.iter().filter(|r| r.kind == kind).count()
    }

    /// Every created resource, in creation order.
    #[must_use]
    pub fn created(&self) -> Vec<CreatedResource> {
        self.state.lock().created.clone()
    }

    /// Resources created and not yet reported terminal.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().building.len()
    }

    /// Most resources ever building at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().peak_building
    }

    /// Number of status calls.
    #[must_use]
    pub fn status_calls(&self) -> usize {
        self.state.lock().status_calls
    }

    /// Number of fetch calls.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.state.lock().fetch_calls
    }

    fn scripted_failure(&self, kind: ResourceKind, params: &serde_json::Value) -> Option<ScriptedFailure> {
        self.failures
            .iter()
            .find(|(_, predicate)| predicate(kind, params))
            .map(|(failure, _)| *failure)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// The payload returned when no fetch override is set.
///
/// Batch predictions yield `row_count` categorical rows labelled by absolute
/// row index; evaluations yield an `accuracy` of `0.80 + 0.02 * fold`.
#[must_use]
pub fn default_payload(remote_id: &RemoteId, resource: Option<&CreatedResource>) -> serde_json::Value {
    let param = |key: &str| resource.and_then(|r| r.params.get(key)).and_then(serde_json::Value::as_u64);

    match resource.map(|r| r.kind) {
        Some(ResourceKind::BatchPrediction) => {
            let offset = param("row_offset").unwrap_or(0);
            let rows = param("row_count").unwrap_or(DEFAULT_PREDICTION_ROWS);
            let predictions: Vec<serde_json::Value> = (offset..offset + rows)
                .map(|row| serde_json::json!({ "output": format!("row-{row}"), "confidence": 0.9 }))
                .collect();
            serde_json::json!({ "predictions": predictions })
        }
        Some(ResourceKind::Evaluation) => {
            #[allow(clippy::cast_precision_loss)]
            let fold = param("fold").unwrap_or(0) as f64;
            serde_json::json!({ "metrics": { "accuracy": 0.02f64.mul_add(fold, 0.80) } })
        }
        _ => serde_json::json!({ "resource": remote_id }),
    }
}

#[async_trait]
impl RemoteClient for ScriptedRemoteClient {
    async fn create(&self, kind: ResourceKind, params: serde_json::Value) -> Result<RemoteId, RemoteError> {
        self.delay().await;
        if take_one(&self.transient_create_errors) {
            return Err(RemoteError::Timeout);
        }

        let failure = self.scripted_failure(kind, &params);
        if failure == Some(ScriptedFailure::Rejected) {
            return Err(RemoteError::Rejected(format!("scripted rejection of {kind}")));
        }

        let mut state = self.state.lock();
        let n = state.next_id.entry(kind).or_insert(0);
        *n += 1;
        let remote_id = RemoteId::new(format!("{kind}/{n}"));

        if failure == Some(ScriptedFailure::Failed) {
            state.doomed.insert(remote_id.clone());
        }
        state.building.insert(remote_id.clone());
        state.peak_building = state.peak_building.max(state.building.len());
        state.created.push(CreatedResource {
            remote_id: remote_id.clone(),
            kind,
            params,
        });
        Ok(remote_id)
    }

    async fn status(&self, remote_id: &RemoteId) -> Result<RemoteStatus, RemoteError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.status_calls += 1;
        if take_one(&self.transient_status_errors) {
            return Err(RemoteError::Transport(anyhow::anyhow!("scripted connection reset")));
        }
        if !state.created.iter().any(|r| &r.remote_id == remote_id) {
            return Ok(RemoteStatus::ready());
        }

        let polls = state.polls.entry(remote_id.clone()).or_insert(0);
        *polls += 1;
        if *polls <= self.polls_before_ready {
            return Ok(RemoteStatus::pending());
        }

        state.building.remove(remote_id);
        if state.doomed.contains(remote_id) {
            Ok(RemoteStatus::failed("scripted build failure"))
        } else {
            Ok(RemoteStatus::ready())
        }
    }

    async fn fetch(&self, remote_id: &RemoteId) -> Result<serde_json::Value, RemoteError> {
        let resource = {
            let mut state = self.state.lock();
            state.fetch_calls += 1;
            state.created.iter().find(|r| &r.remote_id == remote_id).cloned()
        };
        Ok(match &self.fetch {
            Some(fetch) => fetch(remote_id, resource.as_ref()),
            None => default_payload(remote_id, resource.as_ref()),
        })
    }
}
