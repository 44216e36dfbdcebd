//! End-to-end tests: requests run through the executor against a scripted
//! remote platform.

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::combiner::{CombinedArtifact, PredictionValue};
    use crate::config::RunConfig;
    use crate::core::{RemoteId, ResourceKind, StageKind, StageStatus};
    use crate::errors::{ErrorKind, MlchainError};
    use crate::events::CollectingEventSink;
    use crate::pipeline::{build, DataInput, Goal, ModelInput, ModelRecipe, PartitionPlan, PipelineRequest};
    use crate::poller::BackoffConfig;
    use crate::resume::{InMemoryResumeStore, LogEntry, ResumeMode, ResumeStore, RunLock};
    use crate::scheduler::{PipelineExecutor, RunResult};
    use crate::testing::{
        assert_run_failed, assert_run_succeeded, assert_stages_of_kind, assert_status_count,
        ScriptedFailure, ScriptedRemoteClient,
    };

    fn config(dir: &Path) -> RunConfig {
        RunConfig::default()
            .with_backoff(BackoffConfig::new().with_initial_ms(1).with_max_ms(5))
            .with_retry_budget(3)
            .with_log_path(dir.join("execution.log"))
    }

    fn raw(path: &str) -> DataInput {
        DataInput::Raw {
            path: path.to_string(),
        }
    }

    fn evaluate_and_predict() -> PipelineRequest {
        PipelineRequest::new()
            .with_training(raw("train.csv"))
            .with_test(raw("test.csv"))
            .with_goal(Goal::Evaluation)
            .with_goal(Goal::Predictions)
    }

    async fn run(client: &Arc<ScriptedRemoteClient>, config: RunConfig, request: &PipelineRequest) -> RunResult {
        PipelineExecutor::new(client.clone(), config)
            .run_request(request)
            .await
            .unwrap()
    }

    fn rows(result: &RunResult, goal: &Goal) -> Vec<PredictionValue> {
        match result.target(goal).and_then(|t| t.artifact.clone()) {
            Some(CombinedArtifact::Predictions { rows }) => rows.into_iter().map(|r| r.output).collect(),
            other => panic!("expected predictions, got {other:?}"),
        }
    }

    fn label(s: &str) -> PredictionValue {
        PredictionValue::Categorical(s.to_string())
    }

    #[tokio::test]
    async fn test_rerun_of_finished_pipeline_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let request = evaluate_and_predict();

        let first_client = Arc::new(ScriptedRemoteClient::new().with_polls_before_ready(1));
        let first = run(&first_client, config(dir.path()), &request).await;
        assert_run_succeeded(&first);
        // two sources, two datasets, a model, an evaluation and a prediction
        assert_eq!(first.created, 7);
        assert_eq!(first_client.create_count(), 7);

        let second_client = Arc::new(ScriptedRemoteClient::new());
        let sink = Arc::new(CollectingEventSink::new());
        let second = PipelineExecutor::new(second_client.clone(), config(dir.path()))
            .with_event_sink(sink.clone())
            .run_request(&request)
            .await
            .unwrap();

        assert_run_succeeded(&second);
        assert_eq!(second.created, 0);
        assert_eq!(second.resumed, 7);
        assert_eq!(second_client.create_count(), 0);
        assert_eq!(second_client.status_calls(), 0);
        assert_eq!(second.remote_ids(), first.remote_ids());
        assert_stages_of_kind(&second, StageKind::Model, StageStatus::SkippedResumed);
        assert_eq!(sink.events_of_type("stage.resumed").len(), 7);
        assert!(sink.events_of_type("stage.started").is_empty());
    }

    #[tokio::test]
    async fn test_fresh_mode_ignores_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let request = PipelineRequest::new().with_training(raw("train.csv")).with_goal(Goal::Dataset);

        let client = Arc::new(ScriptedRemoteClient::new());
        run(&client, config(dir.path()), &request).await;
        let fresh = run(&client, config(dir.path()).with_resume_mode(ResumeMode::Fresh), &request).await;

        assert_run_succeeded(&fresh);
        assert_eq!(fresh.created, 2);
        assert_eq!(fresh.resumed, 0);
        assert_eq!(client.create_count(), 4);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new().failing_when(ScriptedFailure::Rejected, |kind, params| {
            kind == ResourceKind::Source && params["role"] == "test"
        }));
        let request = evaluate_and_predict().with_goal(Goal::Model);

        let result = run(&client, config(dir.path()), &request).await;

        assert_run_failed(&result);
        assert!(result.target(&Goal::Model).unwrap().succeeded());
        assert!(!result.target(&Goal::Evaluation).unwrap().succeeded());
        assert!(!result.target(&Goal::Predictions).unwrap().succeeded());

        // training source, training dataset, model
        assert_status_count(&result, StageStatus::Succeeded, 3);
        // test source, test dataset, evaluation, prediction
        assert_status_count(&result, StageStatus::Failed, 4);

        let roots: Vec<_> = result.failures.root_causes().collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].kind, ErrorKind::RemoteFailure);
        assert_eq!(result.failures.failures.len(), 4);
        let prediction = result.target(&Goal::Predictions).unwrap();
        assert_eq!(prediction.error.as_ref().unwrap().kind, ErrorKind::UpstreamFailed);
    }

    #[tokio::test]
    async fn test_remote_build_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new().failing_kind(ResourceKind::Evaluation, ScriptedFailure::Failed));
        let result = run(&client, config(dir.path()), &evaluate_and_predict()).await;

        assert_run_failed(&result);
        assert!(result.target(&Goal::Predictions).unwrap().succeeded());
        let evaluation = result.target(&Goal::Evaluation).unwrap();
        assert_eq!(evaluation.error.as_ref().unwrap().kind, ErrorKind::RemoteFailure);
    }

    #[tokio::test]
    async fn test_rerun_reissues_a_failed_resource() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new().failing_kind(ResourceKind::Evaluation, ScriptedFailure::Failed));
        let request = evaluate_and_predict();

        let first = run(&client, config(dir.path()), &request).await;
        assert_run_failed(&first);

        let second = run(&client, config(dir.path()), &request).await;
        assert_run_failed(&second);
        assert_eq!(second.reattached, 0);
        assert_eq!(second.resumed, 6);
        assert_eq!(second.created, 1);
        assert_eq!(client.creates_of(ResourceKind::Evaluation), 2);
        let evaluations: Vec<RemoteId> = client
            .created()
            .into_iter()
            .filter(|r| r.kind == ResourceKind::Evaluation)
            .map(|r| r.remote_id)
            .collect();
        assert_eq!(evaluations, vec![RemoteId::new("evaluation/1"), RemoteId::new("evaluation/2")]);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(
            ScriptedRemoteClient::new()
                .with_polls_before_ready(1)
                .with_latency(Duration::from_millis(5)),
        );
        let request = PipelineRequest::new()
            .with_training(raw("train.csv"))
            .with_test(raw("test.csv"))
            .with_model(ModelInput::Recipe(ModelRecipe::new().with_ensemble(8)))
            .with_goal(Goal::Predictions);

        let result = run(&client, config(dir.path()).with_concurrency(3), &request).await;

        assert_run_succeeded(&result);
        assert_eq!(result.peak_concurrency, 3);
        assert!(client.peak_in_flight() <= 3);
        assert_eq!(client.creates_of(ResourceKind::Model), 8);
        assert_eq!(client.creates_of(ResourceKind::BatchPrediction), 8);
    }

    #[tokio::test]
    async fn test_ready_stages_dispatch_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new());
        let request = evaluate_and_predict();
        let graph = build(&request).unwrap();

        let result = PipelineExecutor::new(client.clone(), config(dir.path()).with_concurrency(1))
            .run(&graph)
            .await
            .unwrap();

        assert_run_succeeded(&result);
        // With one slot every stage runs alone, so creation order is
        // insertion order.
        let created: Vec<RemoteId> = client.created().into_iter().map(|r| r.remote_id).collect();
        let expected: Vec<RemoteId> = graph
            .stages()
            .iter()
            .filter_map(|s| result.stage(&s.id).and_then(|r| r.remote_id.clone()))
            .collect();
        assert_eq!(created, expected);
    }

    #[tokio::test]
    async fn test_reattaches_to_issued_resource() {
        let request = PipelineRequest::new().with_training(raw("train.csv")).with_goal(Goal::Dataset);
        let graph = build(&request).unwrap();
        let source = graph.stages()[0].id.clone();

        let store = Arc::new(InMemoryResumeStore::with_entries(vec![LogEntry::issued(
            source.clone(),
            RemoteId::new("source/77"),
        )]));
        let client = Arc::new(ScriptedRemoteClient::new());
        let sink = Arc::new(CollectingEventSink::new());
        let result = PipelineExecutor::new(client.clone(), RunConfig::default())
            .with_resume_store(store.clone())
            .with_event_sink(sink.clone())
            .run(&graph)
            .await
            .unwrap();

        assert_run_succeeded(&result);
        assert_eq!(result.reattached, 1);
        assert_eq!(result.created, 1);
        assert_eq!(client.creates_of(ResourceKind::Source), 0);
        assert_eq!(
            result.stage(&source).unwrap().remote_id,
            Some(RemoteId::new("source/77"))
        );
        assert_eq!(sink.events_of_type("stage.reattached").len(), 1);

        // The dataset was created from the reattached source.
        let dataset = &client.created()[0];
        assert_eq!(dataset.params["source"], "source/77");
        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.completed(&source), Some(&RemoteId::new("source/77")));
    }

    #[tokio::test]
    async fn test_truncated_log_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let request = PipelineRequest::new().with_training(raw("train.csv")).with_goal(Goal::Dataset);
        let client = Arc::new(ScriptedRemoteClient::new());
        run(&client, config(dir.path()), &request).await;

        let log = dir.path().join("execution.log");
        let mut contents = std::fs::read_to_string(&log).unwrap();
        contents.push_str(r#"{"type":"completed","stage_id":"da"#);
        std::fs::write(&log, contents).unwrap();

        let rerun = run(&client, config(dir.path()), &request).await;
        assert_run_succeeded(&rerun);
        assert_eq!(rerun.created, 0);
        assert_eq!(rerun.resumed, 2);
    }

    #[tokio::test]
    async fn test_corrupt_log_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("execution.log"), "not json\n").unwrap();
        let client = Arc::new(ScriptedRemoteClient::new());

        let err = PipelineExecutor::new(client.clone(), config(dir.path()))
            .run_request(&PipelineRequest::new().with_training(raw("train.csv")).with_goal(Goal::Dataset))
            .await
            .unwrap_err();

        match err {
            MlchainError::ResumeStoreCorrupt(e) => assert_eq!(e.line, 1),
            other => panic!("expected a corrupt log error, got {other:?}"),
        }
        assert_eq!(client.create_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("execution.log");
        let _held = RunLock::acquire(RunLock::path_for(&log), uuid::Uuid::new_v4()).unwrap();

        let err = PipelineExecutor::new(Arc::new(ScriptedRemoteClient::new()), config(dir.path()))
            .run_request(&PipelineRequest::new().with_training(raw("train.csv")).with_goal(Goal::Dataset))
            .await
            .unwrap_err();
        assert!(matches!(err, MlchainError::ConcurrentRun(_)));
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch_and_resumes_later() {
        let dir = tempfile::tempdir().unwrap();
        let request = evaluate_and_predict();

        let stuck = Arc::new(ScriptedRemoteClient::new().with_polls_before_ready(u32::MAX));
        let executor = PipelineExecutor::new(stuck.clone(), config(dir.path()));
        let token = executor.cancellation();
        let handle = tokio::spawn(async move { executor.run_request(&request).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel("operator stop");
        let result = handle.await.unwrap().unwrap();

        assert!(result.cancelled);
        assert_run_failed(&result);
        assert_eq!(stuck.creates_of(ResourceKind::Source), 2);
        assert_eq!(stuck.creates_of(ResourceKind::Dataset), 0);
        assert_stages_of_kind(&result, StageKind::Dataset, StageStatus::Pending);
        for stage in result.stages.iter().filter(|s| s.kind == StageKind::Source) {
            assert_eq!(stage.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        }

        // A later run polls the sources issued before cancellation.
        let client = Arc::new(ScriptedRemoteClient::new());
        let resumed = run(&client, config(dir.path()), &evaluate_and_predict()).await;
        assert_run_succeeded(&resumed);
        assert_eq!(resumed.reattached, 2);
        assert_eq!(client.creates_of(ResourceKind::Source), 0);
    }

    #[tokio::test]
    async fn test_pipeline_deadline_fails_unfinished_stages() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new().with_polls_before_ready(u32::MAX));
        let result = run(&client, config(dir.path()).with_pipeline_timeout(0.1), &evaluate_and_predict()).await;

        assert!(result.cancelled);
        assert_run_failed(&result);
        assert_status_count(&result, StageStatus::Failed, 7);
        assert!(result
            .stages
            .iter()
            .all(|s| s.error.as_ref().map(|e| e.kind) == Some(ErrorKind::Timeout)));
    }

    #[tokio::test]
    async fn test_stage_deadline_fails_only_that_branch() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new().with_polls_before_ready(u32::MAX));
        let request = PipelineRequest::new().with_training(raw("train.csv")).with_goal(Goal::Dataset);
        let result = run(&client, config(dir.path()).with_stage_timeout(0.05), &request).await;

        assert!(!result.cancelled);
        let roots: Vec<_> = result.failures.root_causes().collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].kind, ErrorKind::Timeout);
        assert_eq!(
            result.target(&Goal::Dataset).unwrap().error.as_ref().unwrap().kind,
            ErrorKind::UpstreamFailed
        );
    }

    #[tokio::test]
    async fn test_transient_errors_within_budget_are_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(
            ScriptedRemoteClient::new()
                .with_transient_create_errors(2)
                .with_transient_status_errors(2),
        );
        let request = PipelineRequest::new().with_training(raw("train.csv")).with_goal(Goal::Dataset);
        let result = run(&client, config(dir.path()), &request).await;

        assert_run_succeeded(&result);
        assert_eq!(client.create_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retry_budget_fails_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new().with_transient_status_errors(100));
        let request = PipelineRequest::new().with_training(raw("train.csv")).with_goal(Goal::Dataset);
        let result = run(&client, config(dir.path()).with_retry_budget(2), &request).await;

        assert_run_failed(&result);
        let roots: Vec<_> = result.failures.root_causes().collect();
        assert_eq!(roots[0].kind, ErrorKind::PollExhausted);
        // The budget allows two retries after the first failure.
        assert_eq!(client.status_calls(), 3);
    }

    #[tokio::test]
    async fn test_ensemble_predictions_are_voted() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new().with_fetch(|_, resource| {
            let model = resource
                .and_then(|r| r.params["model"].as_str())
                .unwrap_or_default()
                .to_string();
            let labels = match model.as_str() {
                "model/1" => ["a", "b"],
                "model/2" => ["a", "c"],
                _ => ["b", "c"],
            };
            serde_json::json!({
                "predictions": labels.iter().map(|l| serde_json::json!({ "output": l })).collect::<Vec<_>>()
            })
        }));
        let request = PipelineRequest::new()
            .with_training(raw("train.csv"))
            .with_test(raw("test.csv"))
            .with_model(ModelInput::Recipe(ModelRecipe::new().with_ensemble(3)))
            .with_goal(Goal::Predictions)
            .with_goal(Goal::Model);

        let result = run(&client, config(dir.path()), &request).await;

        assert_run_succeeded(&result);
        assert_eq!(rows(&result, &Goal::Predictions), vec![label("a"), label("c")]);
        match result.target(&Goal::Model).unwrap().artifact.clone() {
            Some(CombinedArtifact::Ensemble { members }) => assert_eq!(members.len(), 3),
            other => panic!("expected an ensemble, got {other:?}"),
        }
        assert_eq!(client.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn test_partitioned_predictions_are_stitched() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new());
        let request = PipelineRequest::new()
            .with_training(raw("train.csv"))
            .with_test(raw("test.csv"))
            .with_partitions(PartitionPlan::new(10, 4))
            .with_goal(Goal::Predictions);

        let result = run(&client, config(dir.path()), &request).await;

        assert_run_succeeded(&result);
        assert_eq!(client.creates_of(ResourceKind::BatchPrediction), 3);
        let expected: Vec<_> = (0..10).map(|row| label(&format!("row-{row}"))).collect();
        assert_eq!(rows(&result, &Goal::Predictions), expected);
    }

    #[tokio::test]
    async fn test_short_partition_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new().with_fetch(|_, resource| {
            let count = resource
                .and_then(|r| r.params["row_count"].as_u64())
                .unwrap_or_default();
            let rows: Vec<_> = (1..count).map(|_| serde_json::json!({ "output": "x" })).collect();
            serde_json::json!({ "predictions": rows })
        }));
        let request = PipelineRequest::new()
            .with_training(raw("train.csv"))
            .with_test(raw("test.csv"))
            .with_partitions(PartitionPlan::new(10, 5))
            .with_goal(Goal::Predictions);

        let result = run(&client, config(dir.path()), &request).await;

        assert_run_failed(&result);
        let target = result.target(&Goal::Predictions).unwrap();
        assert_eq!(target.error.as_ref().unwrap().kind, ErrorKind::PartitionMismatch);
        assert_stages_of_kind(&result, StageKind::BatchPartition, StageStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cross_validation_summary() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new());
        let goal = Goal::CrossValidation {
            folds: 3,
            metric: "accuracy".to_string(),
        };
        let request = PipelineRequest::new().with_training(raw("train.csv")).with_goal(goal.clone());

        let result = run(&client, config(dir.path()), &request).await;

        assert_run_succeeded(&result);
        assert_eq!(client.creates_of(ResourceKind::Model), 3);
        assert_eq!(client.creates_of(ResourceKind::Evaluation), 3);
        match result.target(&goal).unwrap().artifact.clone() {
            Some(CombinedArtifact::CrossValidation(summary)) => {
                assert_eq!(summary.per_fold.len(), 3);
                assert!((summary.mean - 0.82).abs() < 1e-9);
                assert!(summary.std_dev > 0.0);
            }
            other => panic!("expected a cross-validation summary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_existing_resources_are_never_created() {
        let client = Arc::new(ScriptedRemoteClient::new());
        let request = PipelineRequest::new()
            .with_model(ModelInput::Existing {
                id: RemoteId::new("model/abc"),
            })
            .with_test(DataInput::Dataset {
                id: RemoteId::new("dataset/xyz"),
            })
            .with_goal(Goal::Predictions);

        let result = PipelineExecutor::new(client.clone(), RunConfig::default())
            .with_resume_store(Arc::new(InMemoryResumeStore::new()))
            .run_request(&request)
            .await
            .unwrap();

        assert_run_succeeded(&result);
        assert_eq!(result.created, 1);
        assert_eq!(result.resumed, 0);
        let prediction = &client.created()[0];
        assert_eq!(prediction.kind, ResourceKind::BatchPrediction);
        assert_eq!(prediction.params["model"], "model/abc");
        assert_eq!(prediction.params["dataset"], "dataset/xyz");
    }

    #[tokio::test]
    async fn test_event_stream_brackets_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedRemoteClient::new());
        let sink = Arc::new(CollectingEventSink::new());
        let result = PipelineExecutor::new(client.clone(), config(dir.path()))
            .with_event_sink(sink.clone())
            .run_request(&evaluate_and_predict())
            .await
            .unwrap();

        let names = sink.names();
        assert_eq!(names.first(), Some(&"pipeline.started"));
        assert_eq!(names.last(), Some(&"pipeline.completed"));
        assert_eq!(sink.events_of_type("stage.started").len(), result.created);
        assert_eq!(sink.events_of_type("stage.completed").len(), result.created);
    }
}
