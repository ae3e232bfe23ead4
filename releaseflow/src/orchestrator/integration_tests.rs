//! End-to-end tests for event handling through the orchestrator.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::*;
use crate::core::Conclusion;
use crate::correlator::TestOutcome;
use crate::errors::{ErrorClass, PublishError};
use crate::events::CollectingEventSink;
use crate::pipeline::{JitterStrategy, RetryConfig};
use crate::publish::PublishTarget;
use crate::store::FileJobStore;
use crate::testing::{
    results_json, test_config, workflow_event, workflow_run, CollectingReportSink,
    InMemoryArtifactStore, ScriptedPublisher, StaticBuildStep,
};

struct Harness {
    orchestrator: Orchestrator,
    artifacts: Arc<InMemoryArtifactStore>,
    publisher: Arc<ScriptedPublisher>,
    build: Arc<StaticBuildStep>,
    reports: Arc<CollectingReportSink>,
    events: Arc<CollectingEventSink>,
    _scratch: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with(|config| config, None)
    }

    fn with(
        configure: impl FnOnce(OrchestratorConfig) -> OrchestratorConfig,
        store: Option<Arc<dyn JobStore>>,
    ) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let config = configure(test_config(scratch.path(), 3));
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let publisher = Arc::new(ScriptedPublisher::new());
        let build =
            Arc::new(StaticBuildStep::new("widget").with_output_dir(scratch.path().join("dist")));
        let reports = Arc::new(CollectingReportSink::new());
        let events = Arc::new(CollectingEventSink::new());

        let mut builder = Orchestrator::builder(config)
            .with_artifact_store(artifacts.clone())
            .with_publisher(publisher.clone())
            .with_build_step(build.clone())
            .with_report_sink(reports.clone())
            .with_event_sink(events.clone());
        if let Some(store) = store {
            builder = builder.with_store(store);
        }

        Self {
            orchestrator: builder.build().unwrap(),
            artifacts,
            publisher,
            build,
            reports,
            events,
            _scratch: scratch,
        }
    }
}

fn transient(target: &str) -> PublishError {
    PublishError::TransientNetwork {
        target: target.to_string(),
        message: "503 Service Unavailable".to_string(),
    }
}

fn expect_job(outcome: HandleOutcome) -> ReleaseJob {
    match outcome {
        HandleOutcome::Advanced(job) | HandleOutcome::Unchanged(job) => job,
        other => panic!("expected a job outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tag_push_stages_on_first_attempt() {
    let h = Harness::new();

    let outcome = h
        .orchestrator
        .handle(&TriggerEvent::tag_pushed("v1.2.3", "abc123"))
        .await
        .unwrap();

    let job = match outcome {
        HandleOutcome::Advanced(job) => job,
        other => panic!("expected Advanced, got {other:?}"),
    };
    assert_eq!(job.version, "1.2.3");
    assert_eq!(job.stage, ReleaseStage::StagedPublished);
    assert_eq!(job.attempts, 1);
    assert_eq!(h.publisher.calls(PublishTarget::Staging), 1);
    assert_eq!(h.publisher.calls(PublishTarget::Production), 0);
    assert_eq!(
        h.events.kinds(),
        vec![
            "job.created",
            "job.stage_changed",
            "job.stage_changed",
            "job.stage_changed"
        ]
    );
    assert_eq!(
        h.orchestrator.status("v1.2.3").await.unwrap(),
        JobStatus::InProgress {
            stage: ReleaseStage::StagedPublished
        }
    );
}

#[tokio::test]
async fn test_release_after_promoted_is_noop() {
    let h = Harness::new();
    let first = expect_job(
        h.orchestrator
            .handle(&TriggerEvent::release_published("v1.2.3", "abc123"))
            .await
            .unwrap(),
    );
    assert_eq!(first.stage, ReleaseStage::Promoted);

    let again = h
        .orchestrator
        .handle(&TriggerEvent::release_published("v1.2.3", "abc123"))
        .await
        .unwrap();

    assert_eq!(again, HandleOutcome::Unchanged(first.clone()));
    assert_eq!(h.build.calls(), 1);
    assert_eq!(h.publisher.calls(PublishTarget::Production), 1);
    assert_eq!(h.orchestrator.status("1.2.3").await.unwrap(), JobStatus::Promoted);

    let late_tag = h
        .orchestrator
        .handle(&TriggerEvent::tag_pushed("v1.2.3", "abc123"))
        .await
        .unwrap();
    assert_eq!(late_tag, HandleOutcome::Unchanged(first));
}

#[tokio::test]
async fn test_skipped_workflow_is_noop_without_report() {
    let h = Harness::new();
    h.artifacts
        .add_artifact(5, "unit-test-results", results_json(&[("t", TestOutcome::Passed)]));

    let run = workflow_run(5, Conclusion::Skipped, "abc123");
    let outcome = h.orchestrator.handle(&workflow_event(&run)).await.unwrap();

    assert_eq!(outcome, HandleOutcome::NoOp(NoOpReason::Skipped));
    assert!(h.reports.reports().is_empty());
    assert_eq!(h.artifacts.list_calls(), 0);
    assert_eq!(h.events.kinds(), vec!["report.skipped"]);
}

#[tokio::test]
async fn test_completed_workflow_is_reported() {
    let h = Harness::new();
    h.artifacts.add_artifact(
        9,
        "unit-test-results",
        results_json(&[
            ("test_ok", TestOutcome::Passed),
            ("test_broken", TestOutcome::Failed),
        ]),
    );
    h.artifacts.add_artifact(9, "coverage", b"ignored".to_vec());

    let run = workflow_run(9, Conclusion::Failure, "abc123");
    let outcome = h.orchestrator.handle(&workflow_event(&run)).await.unwrap();

    let report = match outcome {
        HandleOutcome::Reported(report) => report,
        other => panic!("expected Reported, got {other:?}"),
    };
    assert_eq!(report.commit_sha, "abc123");
    assert_eq!(report.totals.total(), 2);
    assert_eq!(report.failing_tests(), vec!["test_broken"]);
    assert_eq!(h.reports.reports(), vec![report]);
    assert_eq!(h.events.kinds(), vec!["report.published"]);
}

#[tokio::test]
async fn test_report_delivery_failure_is_not_an_error() {
    let h = Harness::new();
    h.reports.fail_deliveries(true);
    h.artifacts
        .add_artifact(3, "test-results", results_json(&[("t", TestOutcome::Passed)]));

    let run = workflow_run(3, Conclusion::Success, "abc123");
    let outcome = h.orchestrator.handle(&workflow_event(&run)).await.unwrap();

    assert_eq!(outcome.label(), "reported");
    let published = h.events.events_of_type("report.published");
    assert_eq!(published[0].data["delivered"], serde_json::json!(false));
}

#[tokio::test]
async fn test_redelivered_workflow_events_in_one_batch() {
    let h = Harness::new();
    h.artifacts.add_artifact(
        4,
        "unit-test-results",
        results_json(&[("a", TestOutcome::Passed), ("b", TestOutcome::Passed)]),
    );

    let event = workflow_event(&workflow_run(4, Conclusion::Success, "abc123"));
    let results = h
        .orchestrator
        .handle_all(&[event.clone(), event.clone(), event])
        .await;

    for result in results {
        match result.unwrap() {
            HandleOutcome::Reported(report) => assert_eq!(report.totals.passed, 2),
            other => panic!("expected Reported, got {other:?}"),
        }
    }
    assert_eq!(h.reports.reports().len(), 3);
}

#[tokio::test]
async fn test_attached_report_uploaded_to_run() {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = test_config(scratch.path(), 3);
    config.correlator.attach_report = true;
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    artifacts.add_artifact(4, "test-results", results_json(&[("t", TestOutcome::Passed)]));

    let orchestrator = Orchestrator::builder(config)
        .with_artifact_store(artifacts.clone())
        .with_publisher(Arc::new(ScriptedPublisher::new()))
        .with_build_step(Arc::new(StaticBuildStep::new("widget")))
        .build()
        .unwrap();

    let run = workflow_run(4, Conclusion::Success, "abc123");
    orchestrator.handle(&workflow_event(&run)).await.unwrap();

    let blob = artifacts.blob(4, REPORT_ARTIFACT_NAME).unwrap();
    let report: NormalizedReport = serde_json::from_slice(&blob).unwrap();
    assert_eq!(report.run_id, 4);
}

#[tokio::test]
async fn test_placeholder_version_never_staged() {
    let h = Harness::new();

    let err = h
        .orchestrator
        .handle(&TriggerEvent::tag_pushed("v0.0.0", "abc123"))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Validation);
    assert_eq!(h.publisher.calls(PublishTarget::Staging), 0);
    match h.orchestrator.status("0.0.0").await.unwrap() {
        JobStatus::Failed { reason } => assert_eq!(reason.class, ErrorClass::Validation),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_staging_retries_bounded_then_failed() {
    let h = Harness::new();
    h.publisher.fail_always(PublishTarget::Staging, transient("staging"));

    let err = h
        .orchestrator
        .handle(&TriggerEvent::tag_pushed("v1.2.3", "abc123"))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(h.publisher.calls(PublishTarget::Staging), 3);
    assert_eq!(h.events.events_of_type("job.retry_scheduled").len(), 2);

    let job = h.orchestrator.jobs().await.unwrap().remove(0);
    assert_eq!(job.stage, ReleaseStage::Failed);
    assert_eq!(job.failed_from, Some(ReleaseStage::Verified));
    assert_eq!(job.attempts, 3);
}

#[tokio::test]
async fn test_transient_staging_failure_recovers_within_bound() {
    let h = Harness::new();
    h.publisher.fail_times(PublishTarget::Staging, 2, transient("staging"));

    let job = expect_job(
        h.orchestrator
            .handle(&TriggerEvent::tag_pushed("v1.2.3", "abc123"))
            .await
            .unwrap(),
    );

    assert_eq!(job.stage, ReleaseStage::StagedPublished);
    assert_eq!(job.attempts, 3);
    assert_eq!(h.publisher.uploaded(PublishTarget::Staging).len(), 1);
}

#[tokio::test]
async fn test_production_never_retried_then_redriven() {
    let h = Harness::new();
    h.publisher.fail_times(PublishTarget::Production, 1, transient("production"));

    let err = h
        .orchestrator
        .handle(&TriggerEvent::release_published("v1.2.3", "abc123"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(h.publisher.calls(PublishTarget::Production), 1);

    // A repeated delivery does not restart a halted job.
    let repeat = h
        .orchestrator
        .handle(&TriggerEvent::release_published("v1.2.3", "abc123"))
        .await
        .unwrap();
    assert_eq!(expect_job(repeat).stage, ReleaseStage::Failed);
    assert_eq!(h.publisher.calls(PublishTarget::Production), 1);

    let job = expect_job(h.orchestrator.redrive("1.2.3").await.unwrap());
    assert_eq!(job.stage, ReleaseStage::Promoted);
    assert_eq!(h.publisher.calls(PublishTarget::Production), 2);
    assert_eq!(h.publisher.calls(PublishTarget::Staging), 1);
    assert_eq!(h.build.calls(), 1);
}

#[tokio::test]
async fn test_per_version_state_released_after_handling() {
    let h = Harness::new();
    h.publisher.fail_times(
        PublishTarget::Staging,
        1,
        PublishError::Auth {
            target: "staging".to_string(),
            message: "401".to_string(),
        },
    );

    let err = h
        .orchestrator
        .handle(&TriggerEvent::tag_pushed("v1.2.3", "abc123"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Auth);
    h.orchestrator
        .handle(&TriggerEvent::tag_pushed("v2.0.0", "def456"))
        .await
        .unwrap();

    let halted = h
        .orchestrator
        .handle(&TriggerEvent::release_published("v1.2.3", "abc123"))
        .await
        .unwrap();
    assert_eq!(expect_job(halted).stage, ReleaseStage::Failed);
    assert!(h.orchestrator.locks.is_empty());
    assert!(h.orchestrator.claims.is_empty());
    assert_eq!(h.orchestrator.goals.len(), 1);

    let job = expect_job(h.orchestrator.redrive("1.2.3").await.unwrap());
    assert_eq!(job.stage, ReleaseStage::Promoted);
    assert!(h.orchestrator.locks.is_empty());
    assert!(h.orchestrator.claims.is_empty());
    assert!(h.orchestrator.goals.is_empty());
}

#[tokio::test]
async fn test_redrive_rejects_unknown_and_healthy_jobs() {
    let h = Harness::new();
    let err = h.orchestrator.redrive("9.9.9").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Store(StoreError::Missing(_))));

    h.orchestrator
        .handle(&TriggerEvent::tag_pushed("v1.2.3", "abc123"))
        .await
        .unwrap();
    let err = h.orchestrator.redrive("1.2.3").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::NotRedrivable {
            stage: ReleaseStage::StagedPublished,
            ..
        }
    ));
}

#[tokio::test]
async fn test_release_supersedes_staging_backoff() {
    let h = Harness::with(
        |config| {
            config.with_retry(
                RetryConfig::new()
                    .with_max_attempts(5)
                    .with_base_delay_ms(60_000)
                    .with_max_delay_ms(60_000)
                    .with_jitter(JitterStrategy::None),
            )
        },
        None,
    );
    h.publisher.fail_times(PublishTarget::Staging, 1, transient("staging"));

    let tag = TriggerEvent::tag_pushed("v1.2.3", "abc123");
    let release = TriggerEvent::release_published("v1.2.3", "abc123");
    let publisher = h.publisher.clone();

    let (tag_outcome, release_outcome) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(h.orchestrator.handle(&tag), async {
            while publisher.calls(PublishTarget::Staging) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            h.orchestrator.handle(&release).await
        })
    })
    .await
    .unwrap();

    assert!(matches!(
        tag_outcome.unwrap(),
        HandleOutcome::Superseded { ref version, .. } if version == "1.2.3"
    ));
    let job = expect_job(release_outcome.unwrap());
    assert_eq!(job.stage, ReleaseStage::Promoted);
    assert_eq!(h.publisher.calls(PublishTarget::Staging), 2);
    assert_eq!(h.events.events_of_type("job.superseded").len(), 1);
}

#[tokio::test]
async fn test_duplicate_deliveries_publish_once() {
    let h = Harness::new();
    let events = vec![
        TriggerEvent::tag_pushed("v1.2.3", "abc123"),
        TriggerEvent::tag_pushed("v1.2.3", "abc123"),
        TriggerEvent::tag_pushed("refs/tags/v1.2.3", "abc123"),
        TriggerEvent::tag_pushed("v2.0.0", "def456"),
    ];

    let results = h.orchestrator.handle_all(&events).await;

    let labels: Vec<_> = results
        .iter()
        .map(|r| r.as_ref().unwrap().label())
        .collect();
    assert_eq!(labels.iter().filter(|l| **l == "advanced").count(), 2);
    assert_eq!(labels.iter().filter(|l| **l == "unchanged").count(), 2);
    assert_eq!(labels[3], "advanced");
    assert_eq!(
        results[3].as_ref().unwrap().job().unwrap().version,
        "2.0.0"
    );

    assert_eq!(h.build.calls(), 2);
    assert_eq!(h.publisher.calls(PublishTarget::Staging), 2);
    assert_eq!(h.orchestrator.jobs().await.unwrap().len(), 2);
    assert_eq!(h.events.events_of_type("job.created").len(), 2);
}

#[tokio::test]
async fn test_invalid_release_events() {
    let h = Harness::new();

    let no_tag = TriggerEvent::new(TriggerKind::TagPushed, "abc123");
    assert!(matches!(
        h.orchestrator.handle(&no_tag).await.unwrap_err(),
        OrchestratorError::InvalidEvent(_)
    ));

    let no_commit = TriggerEvent::tag_pushed("v1.2.3", "  ");
    assert!(matches!(
        h.orchestrator.handle(&no_commit).await.unwrap_err(),
        OrchestratorError::InvalidEvent(_)
    ));

    h.orchestrator
        .handle(&TriggerEvent::tag_pushed("v1.2.3", "abc123"))
        .await
        .unwrap();
    let other_commit = TriggerEvent::release_published("v1.2.3", "fff000");
    let err = h.orchestrator.handle(&other_commit).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert_eq!(h.publisher.calls(PublishTarget::Production), 0);
}

#[tokio::test]
async fn test_status_unknown_version() {
    let h = Harness::new();
    assert_eq!(h.orchestrator.status("3.1.4").await.unwrap(), JobStatus::Unknown);
}

#[tokio::test]
async fn test_file_store_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.json");

    {
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&path).await.unwrap());
        let h = Harness::with(|config| config, Some(store));
        h.orchestrator
            .handle(&TriggerEvent::tag_pushed("v1.2.3", "abc123"))
            .await
            .unwrap();
    }

    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&path).await.unwrap());
    let h = Harness::with(|config| config, Some(store));
    assert_eq!(
        h.orchestrator.status("1.2.3").await.unwrap(),
        JobStatus::InProgress {
            stage: ReleaseStage::StagedPublished
        }
    );

    let outcome = h
        .orchestrator
        .handle(&TriggerEvent::tag_pushed("v1.2.3", "abc123"))
        .await
        .unwrap();
    assert_eq!(outcome.label(), "unchanged");
    assert_eq!(h.build.calls(), 0);
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    let err = Orchestrator::builder(OrchestratorConfig::default())
        .with_publisher(Arc::new(ScriptedPublisher::new()))
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "artifacts"));

    let err = Orchestrator::builder(OrchestratorConfig::default())
        .with_artifact_store(Arc::new(InMemoryArtifactStore::new()))
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "publish"));
}
