//! Execution of a single dispatched stage.

use std::sync::Arc;

use super::state::Dispatch;
use crate::cancellation::CancellationToken;
use crate::combiner::{combine, needs_payloads, CombineInput};
use crate::core::{CombineOp, RemoteId, ResourceKind, StageId, StageKind, StageParams};
use crate::errors::{ErrorKind, StageError};
use crate::poller::{CompletionPoller, PollOutcome};
use crate::registry::ResourceRegistry;
use crate::resume::ResumeStore;

/// Everything a worker needs, shared by all workers of a run.
pub(crate) struct WorkerContext {
    pub(crate) poller: CompletionPoller,
    pub(crate) store: Arc<dyn ResumeStore>,
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) cancel: Arc<CancellationToken>,
    pub(crate) labels: serde_json::Map<String, serde_json::Value>,
}

/// How a worker finished.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StageOutcome {
    /// The stage succeeded.
    Succeeded {
        /// The remote resource, for remote stages.
        remote_id: Option<RemoteId>,
        /// Whether this run issued the create call.
        created: bool,
    },
    /// The stage failed.
    Failed(StageError),
    /// The run was cancelled while the stage was executing.
    Interrupted(StageError),
}

impl StageOutcome {
    fn from_error(error: StageError) -> Self {
        if error.kind == ErrorKind::Cancelled {
            Self::Interrupted(error)
        } else {
            Self::Failed(error)
        }
    }
}

/// Runs one stage to a terminal outcome.
pub(crate) async fn run_stage(ctx: Arc<WorkerContext>, dispatch: Dispatch) -> StageOutcome {
    let stage_id = dispatch.stage.id.clone();
    let outcome = match &dispatch.stage.params {
        StageParams::Combine(op) => run_combine(&ctx, &stage_id, op, &dispatch.inputs).await,
        _ => run_remote(&ctx, &dispatch).await,
    };

    match &outcome {
        StageOutcome::Succeeded { .. } => {}
        StageOutcome::Failed(error) => {
            ctx.registry.mark_failed(&stage_id);
            tracing::warn!(stage_id = %stage_id, error = %error, "Stage failed");
        }
        StageOutcome::Interrupted(error) => {
            ctx.registry.mark_failed(&stage_id);
            tracing::info!(stage_id = %stage_id, reason = %error.message, "Stage interrupted");
        }
    }
    outcome
}

async fn run_remote(ctx: &WorkerContext, dispatch: &Dispatch) -> StageOutcome {
    let stage = &dispatch.stage;
    let Some(kind) = stage.resource_kind() else {
        return StageOutcome::Failed(StageError::new(
            ErrorKind::Internal,
            format!("stage '{}' creates no remote resource", stage.id),
        ));
    };

    let (remote_id, created) = if let Some(remote_id) = ctx.registry.reattachable(&stage.id) {
        tracing::info!(stage_id = %stage.id, remote_id = %remote_id, "Reattaching to in-flight resource");
        (remote_id, false)
    } else {
        match issue(ctx, dispatch, kind).await {
            Ok(remote_id) => (remote_id, true),
            Err(error) => return StageOutcome::from_error(error),
        }
    };

    match ctx.poller.wait(&stage.id, &remote_id, &ctx.cancel).await {
        PollOutcome::Ready => {
            // The completion must be durable before anyone sees the stage as done.
            if let Err(e) = ctx.store.record_completed(&stage.id, &remote_id).await {
                return StageOutcome::Failed(e.into());
            }
            ctx.registry.mark_ready(&stage.id, remote_id.clone());
            StageOutcome::Succeeded {
                remote_id: Some(remote_id),
                created,
            }
        }
        PollOutcome::Failed(error) => {
            if error.kind == ErrorKind::RemoteFailure {
                // Terminal on the platform: a later run must issue a new resource.
                if let Err(e) = ctx.store.record_failed(&stage.id, &remote_id).await {
                    tracing::warn!(stage_id = %stage.id, remote_id = %remote_id, error = %e, "Could not log failed resource");
                }
            }
            StageOutcome::Failed(error)
        }
        PollOutcome::Abandoned => StageOutcome::Interrupted(cancelled(&ctx.cancel)),
    }
}

async fn issue(ctx: &WorkerContext, dispatch: &Dispatch, kind: ResourceKind) -> Result<RemoteId, StageError> {
    let stage = &dispatch.stage;
    let inputs = input_resources(ctx, &dispatch.inputs)?;
    let params = stage.params.create_params(&inputs, &ctx.labels);

    let remote_id = ctx.poller.issue(&stage.id, kind, params, &ctx.cancel).await?;
    tracing::info!(stage_id = %stage.id, remote_id = %remote_id, kind = %kind, "Resource issued");

    ctx.registry.mark_building(&stage.id, remote_id.clone());
    ctx.store
        .record_issued(&stage.id, &remote_id)
        .await
        .map_err(StageError::from)?;
    Ok(remote_id)
}

/// Resolves the remote resources of a remote stage's inputs.
fn input_resources(
    ctx: &WorkerContext,
    inputs: &[(StageId, StageKind)],
) -> Result<Vec<(ResourceKind, RemoteId)>, StageError> {
    inputs
        .iter()
        .filter_map(|(id, kind)| ResourceKind::for_stage(*kind).map(|resource| (id, resource)))
        .map(|(id, resource)| {
            ctx.registry
                .remote_id(id)
                .map(|remote_id| (resource, remote_id))
                .ok_or_else(|| {
                    StageError::new(
                        ErrorKind::Internal,
                        format!("input stage '{id}' has no remote resource"),
                    )
                })
        })
        .collect()
}

async fn run_combine(
    ctx: &WorkerContext,
    stage_id: &StageId,
    op: &CombineOp,
    inputs: &[(StageId, StageKind)],
) -> StageOutcome {
    let fetch_payloads = needs_payloads(op);
    let mut collected = Vec::with_capacity(inputs.len());

    for (input_id, kind) in inputs {
        if *kind == StageKind::Combine {
            let Some(artifact) = ctx.registry.artifact(input_id) else {
                return StageOutcome::Failed(StageError::new(
                    ErrorKind::Internal,
                    format!("combine input '{input_id}' has no artifact"),
                ));
            };
            collected.push(CombineInput::Local(artifact));
            continue;
        }

        let Some(remote_id) = ctx.registry.remote_id(input_id) else {
            return StageOutcome::Failed(StageError::new(
                ErrorKind::Internal,
                format!("combine input '{input_id}' has no remote resource"),
            ));
        };
        let payload = if fetch_payloads {
            match ctx.poller.fetch(&remote_id, &ctx.cancel).await {
                Ok(payload) => Some(payload),
                Err(error) => return StageOutcome::from_error(error),
            }
        } else {
            None
        };
        collected.push(CombineInput::Remote { remote_id, payload });
    }

    match combine(op, collected) {
        Ok(artifact) => {
            tracing::debug!(stage_id = %stage_id, "Combine finished");
            ctx.registry.mark_combined(stage_id, artifact);
            StageOutcome::Succeeded {
                remote_id: None,
                created: false,
            }
        }
        Err(e) => StageOutcome::Failed(e.into()),
    }
}

fn cancelled(cancel: &CancellationToken) -> StageError {
    StageError::new(
        ErrorKind::Cancelled,
        cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
    )
}
