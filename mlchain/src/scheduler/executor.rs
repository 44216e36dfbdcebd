//! Pipeline executor: runs a stage graph against a remote client.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::result::{RunResult, StageReport, TargetResult};
use super::state::{Presatisfied, SchedulerState};
use super::worker::{run_stage, StageOutcome, WorkerContext};
use crate::cancellation::CancellationToken;
use crate::client::RemoteClient;
use crate::config::RunConfig;
use crate::core::StageStatus;
use crate::errors::{ErrorKind, MlchainError, StageError, TimeoutError};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::observability::Timer;
use crate::pipeline::{build, FailureRecord, FailureSummary, PipelineGraph, PipelineRequest};
use crate::poller::CompletionPoller;
use crate::registry::ResourceRegistry;
use crate::resume::{FileResumeStore, ResumeMode, ResumeSnapshot, ResumeStore};
use crate::utils::generate_run_id;

/// Runs pipeline graphs with bounded concurrency, resumability and failure
/// isolation.
///
/// By default the execution log lives at the configured `log_path`; tests and
/// embedders can supply any [`ResumeStore`] instead.
pub struct PipelineExecutor {
    client: Arc<dyn RemoteClient>,
    config: RunConfig,
    store: Option<Arc<dyn ResumeStore>>,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("config", &self.config)
            .field("custom_store", &self.store.is_some())
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl PipelineExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(client: Arc<dyn RemoteClient>, config: RunConfig) -> Self {
        Self {
            client,
            config,
            store: None,
            sink: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Uses `store` instead of the file-backed execution log.
    #[must_use]
    pub fn with_resume_store(mut self, store: Arc<dyn ResumeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sends lifecycle events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The token that cancels runs of this executor.
    #[must_use]
    pub fn cancellation(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Builds the graph for `request` and runs it.
    pub async fn run_request(&self, request: &PipelineRequest) -> Result<RunResult, MlchainError> {
        let graph = build(request)?;
        self.run(&graph).await
    }

    /// Runs a graph to completion, cancellation or deadline.
    ///
    /// Stage failures never make this return an error; they are reported in
    /// the [`RunResult`]. Errors are returned only when the run cannot start:
    /// an invalid config, a corrupt execution log or a concurrent run.
    pub async fn run(&self, graph: &PipelineGraph) -> Result<RunResult, MlchainError> {
        self.config.validate()?;
        let run_id = generate_run_id();
        let timer = Timer::start();

        let store = self.open_store(run_id)?;
        let snapshot = if self.config.resume_mode == ResumeMode::Fresh {
            ResumeSnapshot::new()
        } else {
            store.load().await?
        };

        let registry = Arc::new(ResourceRegistry::new());
        let stage_ids = graph.stage_ids();
        registry.seed(&stage_ids, &snapshot);

        let mut state = SchedulerState::new(graph, self.config.concurrency);
        let presatisfied = state.apply_resume(&snapshot);
        let mut resumed = 0;
        for entry in &presatisfied {
            match entry {
                Presatisfied::Existing { stage_id, remote_id } => {
                    registry.mark_ready(stage_id, remote_id.clone());
                }
                Presatisfied::Resumed { .. } => resumed += 1,
            }
        }

        tracing::info!(
            run_id = %run_id,
            stages = graph.len(),
            resumable = resumed,
            concurrency = self.config.concurrency,
            "Pipeline run started"
        );
        self.sink
            .emit(&PipelineEvent::PipelineStarted {
                run_id,
                stages: graph.len(),
                resumable: resumed,
            })
            .await;
        for entry in presatisfied {
            if let Presatisfied::Resumed { stage_id, remote_id } = entry {
                self.sink
                    .emit(&PipelineEvent::StageResumed { stage_id, remote_id })
                    .await;
            }
        }

        // Workers observe a run-scoped token so the deadline never cancels the
        // caller's token.
        let run_cancel = Arc::new(CancellationToken::new());
        let ctx = Arc::new(WorkerContext {
            poller: CompletionPoller::new(Arc::clone(&self.client), self.config.poll_policy()),
            store,
            registry: Arc::clone(&registry),
            cancel: Arc::clone(&run_cancel),
            labels: graph.labels().clone(),
        });

        let mut run = RunProgress::new(graph.len());
        let deadline = self.config.pipeline_timeout().map(|limit| (Instant::now() + limit, limit));
        let mut in_flight = FuturesUnordered::new();
        let mut stopping = false;
        let mut expired = false;

        loop {
            if !stopping && self.cancel.is_cancelled() {
                stopping = true;
                let reason = self.cancel.reason().unwrap_or_else(|| "cancelled".to_string());
                run_cancel.cancel(reason.clone());
                state.halt();
                run.cancelled = true;
                tracing::warn!(run_id = %run_id, reason = %reason, running = state.running(), "Pipeline cancelled");
                self.sink.emit(&PipelineEvent::PipelineCancelled { reason }).await;
            }

            while let Some(dispatch) = state.next_dispatch() {
                let pos = dispatch.pos;
                let stage_id = dispatch.stage.id.clone();
                let kind = dispatch.stage.kind();

                let event = match registry.reattachable(&stage_id) {
                    Some(remote_id) => {
                        run.reattached += 1;
                        PipelineEvent::StageReattached {
                            stage_id: stage_id.clone(),
                            remote_id,
                        }
                    }
                    None => PipelineEvent::StageStarted {
                        stage_id: stage_id.clone(),
                        kind,
                    },
                };
                self.sink.emit(&event).await;
                run.started.insert(pos, Timer::start());

                let span = tracing::info_span!("stage", stage_id = %stage_id, kind = %kind);
                let handle = tokio::spawn(run_stage(Arc::clone(&ctx), dispatch).instrument(span));
                in_flight.push(async move { (pos, handle.await) });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((pos, joined)) = in_flight.next() => {
                    let outcome = joined.unwrap_or_else(|e| {
                        StageOutcome::Failed(StageError::new(
                            ErrorKind::Internal,
                            format!("stage task ended abnormally: {e}"),
                        ))
                    });
                    self.settle(&mut state, &mut run, pos, outcome).await;
                }
                () = wait_until(deadline.map(|(at, _)| at)), if !expired => {
                    expired = true;
                    stopping = true;
                    run.cancelled = true;
                    let limit = deadline.map_or(0.0, |(_, limit)| limit.as_secs_f64());
                    let error = StageError::from(MlchainError::from(TimeoutError::pipeline(limit)));
                    tracing::warn!(run_id = %run_id, timeout_secs = limit, "Pipeline deadline exceeded");
                    run_cancel.cancel(error.message.clone());
                    for pos in state.expire(&error) {
                        let stage_id = state.stage(pos).id.clone();
                        run.failures.record(FailureRecord::new(stage_id.clone(), &error));
                        self.sink
                            .emit(&PipelineEvent::StageFailed { stage_id, error: error.clone() })
                            .await;
                    }
                }
                () = self.cancel.cancelled(), if !stopping => {}
            }
        }

        let result = Self::finish(graph, &state, &registry, run, run_id, resumed, &timer);
        tracing::info!(
            run_id = %run_id,
            success = result.success,
            created = result.created,
            resumed = result.resumed,
            failed = result.failures.failed_stages,
            duration_ms = result.duration_ms,
            "Pipeline run finished"
        );
        self.sink
            .emit(&PipelineEvent::PipelineCompleted {
                success: result.success,
                created: result.created,
                resumed: result.resumed,
                duration_ms: result.duration_ms,
            })
            .await;
        Ok(result)
    }

    fn open_store(&self, run_id: Uuid) -> Result<Arc<dyn ResumeStore>, MlchainError> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        let store = FileResumeStore::open(&self.config.log_path, self.config.resume_mode, run_id)?;
        Ok(Arc::new(store))
    }

    /// Applies a worker's outcome to the scheduler state and reports it.
    async fn settle(&self, state: &mut SchedulerState, run: &mut RunProgress, pos: usize, outcome: StageOutcome) {
        let was_running = state.stage(pos).status == StageStatus::Running;
        let stage_id = state.stage(pos).id.clone();
        let duration_ms = run.started.remove(&pos).map_or(0, |t| t.elapsed_ms());

        match outcome {
            StageOutcome::Succeeded { remote_id, created } => {
                if created {
                    run.created += 1;
                }
                state.complete(pos, remote_id.clone());
                if was_running {
                    self.sink
                        .emit(&PipelineEvent::StageCompleted {
                            stage_id,
                            remote_id,
                            duration_ms,
                        })
                        .await;
                }
            }
            StageOutcome::Failed(error) => {
                let downstream = state.fail(pos, error.clone());
                if !was_running {
                    return;
                }
                run.failures.record(FailureRecord::new(stage_id.clone(), &error));
                self.sink.emit(&PipelineEvent::StageFailed { stage_id, error }).await;

                for next in downstream {
                    let stage = state.stage(next);
                    let Some(error) = stage.error.clone() else {
                        continue;
                    };
                    run.failures.record(FailureRecord::new(stage.id.clone(), &error));
                    self.sink
                        .emit(&PipelineEvent::StageUpstreamFailed {
                            stage_id: stage.id.clone(),
                            error,
                        })
                        .await;
                }
            }
            StageOutcome::Interrupted(error) => {
                state.interrupt(pos, error.clone());
                if was_running {
                    run.failures.record(FailureRecord::new(stage_id.clone(), &error));
                    self.sink.emit(&PipelineEvent::StageFailed { stage_id, error }).await;
                }
            }
        }
    }

    fn finish(
        graph: &PipelineGraph,
        state: &SchedulerState,
        registry: &ResourceRegistry,
        run: RunProgress,
        run_id: Uuid,
        resumed: usize,
        timer: &Timer,
    ) -> RunResult {
        let targets: Vec<TargetResult> = graph
            .targets()
            .iter()
            .filter_map(|target| {
                let stage = state.stage(graph.position(&target.stage_id)?);
                Some(TargetResult {
                    goal: target.goal.clone(),
                    stage_id: stage.id.clone(),
                    status: stage.status,
                    remote_id: stage.remote_id.clone(),
                    artifact: registry.artifact(&stage.id),
                    error: stage.error.clone(),
                })
            })
            .collect();
        let stages: Vec<StageReport> = state.stages().iter().map(StageReport::from).collect();

        let mut failures = run.failures;
        failures.completed_stages = stages.iter().filter(|s| s.status.is_satisfied()).count();

        RunResult {
            run_id,
            success: !run.cancelled && targets.iter().all(TargetResult::succeeded),
            targets,
            stages,
            failures,
            created: run.created,
            resumed,
            reattached: run.reattached,
            cancelled: run.cancelled,
            peak_concurrency: state.peak_running(),
            duration_ms: timer.elapsed_ms(),
        }
    }
}

/// Counters accumulated while a run is in progress.
struct RunProgress {
    started: HashMap<usize, Timer>,
    failures: FailureSummary,
    created: usize,
    reattached: usize,
    cancelled: bool,
}

impl RunProgress {
    fn new(total_stages: usize) -> Self {
        Self {
            started: HashMap::new(),
            failures: FailureSummary::new(total_stages),
            created: 0,
            reattached: 0,
            cancelled: false,
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
