//! Drives release jobs through their stages.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::build::BuildStep;
use super::retry::{with_retry_notify, RetryConfig, RetryFailure, RetryPolicy};
use super::transition::{transition, Step};
use super::verify::ArtifactVerifier;
use crate::cancellation::CancellationToken;
use crate::core::{JobKey, LoadedArtifact, ReleaseJob, ReleaseStage};
use crate::errors::{PipelineError, PublishError, VerificationError};
use crate::events::{EventKind, EventSink, LifecycleEvent, NoOpEventSink};
use crate::publish::{PublishTarget, Publisher};
use crate::store::JobStore;

/// Runs build, verification and publishing for release jobs.
///
/// Every stage change is computed by [`transition`] and persisted with a
/// compare-and-swap, so a stale writer fails with a conflict instead of
/// overwriting newer state. Staging uploads are retried on transient
/// errors; production uploads run exactly once.
pub struct ReleasePipeline {
    store: Arc<dyn JobStore>,
    build: Arc<dyn BuildStep>,
    verifier: ArtifactVerifier,
    publisher: Arc<dyn Publisher>,
    events: Arc<dyn EventSink>,
    staging_policy: RetryPolicy,
    production_policy: RetryPolicy,
    artifacts: DashMap<JobKey, LoadedArtifact>,
}

impl ReleasePipeline {
    /// Creates a pipeline with default verification and retry settings.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        build: Arc<dyn BuildStep>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            store,
            build,
            verifier: ArtifactVerifier::default(),
            publisher,
            events: Arc::new(NoOpEventSink),
            staging_policy: RetryPolicy::transient(RetryConfig::default()),
            production_policy: RetryPolicy::never(),
            artifacts: DashMap::new(),
        }
    }

    /// Sets the verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: ArtifactVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the retry configuration for staging uploads.
    #[must_use]
    pub fn with_staging_retry(mut self, config: RetryConfig) -> Self {
        self.staging_policy = RetryPolicy::transient(config);
        self
    }

    /// The job store this pipeline writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Advances `job` until it reaches `goal`, fails, or `token` is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns the error that moved the job to `Failed`, a store error, or
    /// [`PipelineError::Superseded`] if a newer event took over. A
    /// superseded job keeps its current stage.
    pub async fn drive(
        &self,
        job: ReleaseJob,
        goal: ReleaseStage,
        token: &CancellationToken,
    ) -> Result<ReleaseJob, PipelineError> {
        let key = job.key();
        let result = self.advance(job, goal, token).await;
        // Later drives read the artifact back from its recorded path.
        self.artifacts.remove(&key);
        result
    }

    async fn advance(
        &self,
        mut job: ReleaseJob,
        goal: ReleaseStage,
        token: &CancellationToken,
    ) -> Result<ReleaseJob, PipelineError> {
        while !job.stage.is_terminal() && !job.stage.has_reached(goal) {
            if token.is_cancelled() {
                return Err(self.superseded(&job, token).await);
            }
            job = match job.stage {
                ReleaseStage::Pending => self.run_build(job).await?,
                ReleaseStage::Built => self.run_verify(job).await?,
                ReleaseStage::Verified => self.run_staging(job, token).await?,
                ReleaseStage::StagedPublished => self.run_promotion(job).await?,
                ReleaseStage::Promoted | ReleaseStage::Failed => break,
            };
        }
        Ok(job)
    }

    /// Moves a failed job back to the stage it failed from.
    ///
    /// # Errors
    ///
    /// Returns a transition error if the job is not `Failed`.
    pub async fn redrive(&self, job: &ReleaseJob) -> Result<ReleaseJob, PipelineError> {
        info!(version = %job.version, failed_from = ?job.failed_from, "Re-driving job");
        self.commit(job, Step::Redrive).await
    }

    async fn run_build(&self, job: ReleaseJob) -> Result<ReleaseJob, PipelineError> {
        let artifact = match self.build.build(&job).await {
            Ok(artifact) => artifact,
            Err(e) => return Err(self.fail(&job, e.into(), 1).await),
        };
        self.artifacts.insert(job.key(), artifact.clone());
        self.commit(&job, Step::Build(artifact.meta)).await
    }

    async fn run_verify(&self, job: ReleaseJob) -> Result<ReleaseJob, PipelineError> {
        let checked = match self.load_artifact(&job).await {
            Ok(artifact) => self.verifier.verify(&job, &artifact).map_err(PipelineError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = checked {
            return Err(self.fail(&job, e, 1).await);
        }
        self.commit(&job, Step::Verify).await
    }

    async fn run_staging(
        &self,
        job: ReleaseJob,
        token: &CancellationToken,
    ) -> Result<ReleaseJob, PipelineError> {
        let artifact = match self.load_artifact(&job).await {
            Ok(artifact) => artifact,
            Err(e) => return Err(self.fail(&job, e, 0).await),
        };

        let key = job.key().to_string();
        let mut attempts = 0;
        let result = with_retry_notify(
            &self.staging_policy,
            &key,
            token,
            |attempt, delay: Duration, e: &PublishError| {
                warn!(version = %job.version, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Staging upload failed, retrying");
                self.events.try_emit(
                    LifecycleEvent::new(EventKind::JobRetryScheduled)
                        .with_key(key.clone())
                        .with_data(json!({
                            "target": PublishTarget::Staging,
                            "attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                            "error": e.to_string(),
                        })),
                );
            },
            |attempt| {
                attempts = attempt;
                self.publisher
                    .publish(PublishTarget::Staging, &job.version, &artifact)
            },
        )
        .await;

        match result {
            Ok(()) => self.commit(&job, Step::Stage { attempts }).await,
            Err(RetryFailure::Cancelled { .. }) => Err(self.superseded(&job, token).await),
            Err(failure) => {
                let attempts = failure.attempts();
                Err(self.fail(&job, failure.into_error().into(), attempts).await)
            }
        }
    }

    async fn run_promotion(&self, job: ReleaseJob) -> Result<ReleaseJob, PipelineError> {
        let artifact = match self.load_artifact(&job).await {
            Ok(artifact) => artifact,
            Err(e) => return Err(self.fail(&job, e, 0).await),
        };

        let key = job.key().to_string();
        let never_cancelled = CancellationToken::new();
        let result = with_retry_notify(
            &self.production_policy,
            &key,
            &never_cancelled,
            |_, _, _| {},
            |_| {
                self.publisher
                    .publish(PublishTarget::Production, &job.version, &artifact)
            },
        )
        .await;

        match result {
            Ok(()) => self.commit(&job, Step::Promote).await,
            Err(failure) => {
                let attempts = failure.attempts();
                Err(self.fail(&job, failure.into_error().into(), attempts).await)
            }
        }
    }

    /// Returns the job's artifact, reading it back from disk when the
    /// current drive has not cached it. Content must still match the
    /// recorded digest.
    async fn load_artifact(&self, job: &ReleaseJob) -> Result<LoadedArtifact, PipelineError> {
        let key = job.key();
        if let Some(cached) = self.artifacts.get(&key) {
            return Ok(cached.value().clone());
        }

        let unavailable = |message: String| {
            PipelineError::from(
                VerificationError::new(message).with_checks(vec!["artifact_available".to_string()]),
            )
        };
        let meta = job
            .artifact
            .clone()
            .ok_or_else(|| unavailable(format!("job {} has no recorded artifact", job.version)))?;
        let path = meta
            .path
            .clone()
            .ok_or_else(|| unavailable(format!("artifact {} has no path", meta.file_name)))?;
        let content = tokio::fs::read(&path)
            .await
            .map_err(|e| unavailable(format!("artifact {} not readable: {e}", path.display())))?;

        let loaded = LoadedArtifact { meta, content };
        if !loaded.digest_matches() {
            return Err(VerificationError::new(format!(
                "artifact {} changed since it was built",
                path.display()
            ))
            .with_checks(vec!["checksum".to_string()])
            .into());
        }
        self.artifacts.insert(key, loaded.clone());
        Ok(loaded)
    }

    async fn commit(&self, job: &ReleaseJob, step: Step) -> Result<ReleaseJob, PipelineError> {
        let from = job.stage;
        let next = transition(job, step)?;
        let stored = self
            .store
            .compare_and_swap(&job.key(), job.stage, job.revision, next)
            .await?;

        info!(
            version = %stored.version,
            commit = %stored.commit,
            from = %from,
            stage = %stored.stage,
            revision = stored.revision,
            "Job stage changed"
        );
        self.events
            .emit(
                LifecycleEvent::new(EventKind::JobStageChanged)
                    .with_key(stored.key().to_string())
                    .with_data(json!({
                        "from": from,
                        "to": stored.stage,
                        "revision": stored.revision,
                        "attempts": stored.attempts,
                    })),
            )
            .await;
        Ok(stored)
    }

    /// Records `cause` on the job and moves it to `Failed`.
    ///
    /// Returns `cause`, or the store error if the failure could not be
    /// recorded.
    async fn fail(&self, job: &ReleaseJob, cause: PipelineError, attempts: u32) -> PipelineError {
        let recorded = cause.to_recorded();
        let step = Step::Fail {
            error: recorded.clone(),
            attempts,
        };
        let failed = match self.commit(job, step).await {
            Ok(failed) => failed,
            Err(e) => {
                error!(version = %job.version, error = %e, cause = %cause, "Failed to record job failure");
                return e;
            }
        };

        if recorded.class.needs_alert() {
            error!(
                alert = true,
                version = %failed.version,
                class = %recorded.class,
                "Release halted on rejected credentials"
            );
        } else {
            error!(version = %failed.version, class = %recorded.class, error = %recorded.message, "Release job failed");
        }
        self.events
            .emit(
                LifecycleEvent::new(EventKind::JobFailed)
                    .with_key(failed.key().to_string())
                    .with_data(failed.summary()),
            )
            .await;
        cause
    }

    async fn superseded(&self, job: &ReleaseJob, token: &CancellationToken) -> PipelineError {
        let reason = token
            .reason()
            .unwrap_or_else(|| "superseded by a newer event".to_string());
        info!(version = %job.version, stage = %job.stage, reason = %reason, "Job superseded");
        self.events
            .emit(
                LifecycleEvent::new(EventKind::JobSuperseded)
                    .with_key(job.key().to_string())
                    .with_data(json!({"stage": job.stage, "reason": reason})),
            )
            .await;
        PipelineError::Superseded(reason)
    }
}

impl std::fmt::Debug for ReleasePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleasePipeline")
            .field("staging_policy", &self.staging_policy)
            .field("production_policy", &self.production_policy)
            .field("cached_artifacts", &self.artifacts.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TriggerKind;
    use crate::errors::ErrorClass;
    use crate::events::CollectingEventSink;
    use crate::pipeline::JitterStrategy;
    use crate::publish::MockPublisher;
    use crate::store::InMemoryJobStore;
    use crate::testing::{ScriptedPublisher, StaticBuildStep};
    use pretty_assertions::assert_eq;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(max_attempts)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    async fn stored_job(store: &InMemoryJobStore, version: &str) -> ReleaseJob {
        store
            .insert_if_absent(ReleaseJob::new(version, "abc", TriggerKind::TagPushed))
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn test_drive_to_staged() {
        let store = Arc::new(InMemoryJobStore::new());
        let publisher = Arc::new(ScriptedPublisher::new());
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = ReleasePipeline::new(
            store.clone(),
            Arc::new(StaticBuildStep::new("widget")),
            publisher.clone(),
        )
        .with_event_sink(events.clone());

        let job = stored_job(&store, "1.2.3").await;
        let staged = pipeline
            .drive(job, ReleaseStage::StagedPublished, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(staged.stage, ReleaseStage::StagedPublished);
        assert_eq!(staged.revision, 3);
        assert_eq!(staged.attempts, 1);
        assert_eq!(publisher.calls(PublishTarget::Staging), 1);
        assert_eq!(publisher.calls(PublishTarget::Production), 0);
        assert_eq!(events.events_of_type("job.stage_changed").len(), 3);
    }

    #[tokio::test]
    async fn test_build_failure_is_recorded() {
        let store = Arc::new(InMemoryJobStore::new());
        let pipeline = ReleasePipeline::new(
            store.clone(),
            Arc::new(StaticBuildStep::failing("compiler exploded")),
            Arc::new(ScriptedPublisher::new()),
        );

        let job = stored_job(&store, "1.2.3").await;
        let err = pipeline
            .drive(job, ReleaseStage::Promoted, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Build);

        let stored = store.get(&JobKey::new("1.2.3")).await.unwrap().unwrap();
        assert_eq!(stored.stage, ReleaseStage::Failed);
        assert_eq!(stored.failed_from, Some(ReleaseStage::Pending));
        assert_eq!(stored.last_error.unwrap().class, ErrorClass::Build);
    }

    #[tokio::test]
    async fn test_production_failure_is_not_retried() {
        let store = Arc::new(InMemoryJobStore::new());
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|target, _, _| *target == PublishTarget::Staging)
            .times(1)
            .returning(|_, _, _| Ok(()));
        publisher
            .expect_publish()
            .withf(|target, _, _| *target == PublishTarget::Production)
            .times(1)
            .returning(|_, _, _| {
                Err(PublishError::TransientNetwork {
                    target: "production".to_string(),
                    message: "503".to_string(),
                })
            });

        let pipeline = ReleasePipeline::new(
            store.clone(),
            Arc::new(StaticBuildStep::new("widget")),
            Arc::new(publisher),
        )
        .with_staging_retry(fast_retry(5));

        let job = stored_job(&store, "1.2.3").await;
        let err = pipeline
            .drive(job, ReleaseStage::Promoted, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);

        let stored = store.get(&JobKey::new("1.2.3")).await.unwrap().unwrap();
        assert_eq!(stored.stage, ReleaseStage::Failed);
        assert_eq!(stored.failed_from, Some(ReleaseStage::StagedPublished));
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_artifact_reloaded_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("widget-1.2.3.tar.gz");
        std::fs::write(&path, b"sdist").unwrap();

        let mut job = ReleaseJob::new("1.2.3", "abc", TriggerKind::TagPushed);
        job.stage = ReleaseStage::StagedPublished;
        job.artifact = Some(
            LoadedArtifact::from_content("widget", "widget-1.2.3.tar.gz", b"sdist".to_vec())
                .with_path(&path)
                .meta,
        );
        let store = Arc::new(InMemoryJobStore::from_jobs([job.clone()]));
        let publisher = Arc::new(ScriptedPublisher::new());
        let pipeline = ReleasePipeline::new(
            store.clone(),
            Arc::new(StaticBuildStep::new("widget")),
            publisher.clone(),
        );

        let promoted = pipeline
            .drive(job, ReleaseStage::Promoted, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(promoted.stage, ReleaseStage::Promoted);
        assert_eq!(publisher.uploaded(PublishTarget::Production), vec![b"sdist".to_vec()]);
    }

    #[tokio::test]
    async fn test_tampered_artifact_fails_promotion() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("widget-1.2.3.tar.gz");
        std::fs::write(&path, b"tampered").unwrap();

        let mut job = ReleaseJob::new("1.2.3", "abc", TriggerKind::TagPushed);
        job.stage = ReleaseStage::StagedPublished;
        job.artifact = Some(
            LoadedArtifact::from_content("widget", "widget-1.2.3.tar.gz", b"sdist".to_vec())
                .with_path(&path)
                .meta,
        );
        let store = Arc::new(InMemoryJobStore::from_jobs([job.clone()]));
        let publisher = Arc::new(ScriptedPublisher::new());
        let pipeline = ReleasePipeline::new(
            store.clone(),
            Arc::new(StaticBuildStep::new("widget")),
            publisher.clone(),
        );

        let err = pipeline
            .drive(job, ReleaseStage::Promoted, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(publisher.calls(PublishTarget::Production), 0);
    }

    #[tokio::test]
    async fn test_artifact_cache_cleared_after_each_drive() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let publisher = Arc::new(ScriptedPublisher::new());
        publisher.fail_always(
            PublishTarget::Staging,
            PublishError::Auth {
                target: "staging".to_string(),
                message: "401".to_string(),
            },
        );
        let pipeline = ReleasePipeline::new(
            store.clone(),
            Arc::new(StaticBuildStep::new("widget").with_output_dir(tmp.path())),
            publisher.clone(),
        );

        let job = stored_job(&store, "1.0.0").await;
        let err = pipeline
            .drive(job, ReleaseStage::StagedPublished, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Auth);
        assert_eq!(pipeline.artifacts.len(), 0);

        publisher.recover(PublishTarget::Staging);
        let job = stored_job(&store, "2.0.0").await;
        let staged = pipeline
            .drive(job, ReleaseStage::StagedPublished, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(staged.stage, ReleaseStage::StagedPublished);
        assert_eq!(pipeline.artifacts.len(), 0);

        let promoted = pipeline
            .drive(staged, ReleaseStage::Promoted, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(promoted.stage, ReleaseStage::Promoted);
        assert_eq!(publisher.uploaded(PublishTarget::Production).len(), 1);
        assert_eq!(pipeline.artifacts.len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_token_supersedes_without_failing() {
        let store = Arc::new(InMemoryJobStore::new());
        let pipeline = ReleasePipeline::new(
            store.clone(),
            Arc::new(StaticBuildStep::new("widget")),
            Arc::new(ScriptedPublisher::new()),
        );
        let token = CancellationToken::new();
        token.cancel("release published");

        let job = stored_job(&store, "1.2.3").await;
        let err = pipeline
            .drive(job, ReleaseStage::StagedPublished, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Superseded(ref r) if r == "release published"));

        let stored = store.get(&JobKey::new("1.2.3")).await.unwrap().unwrap();
        assert_eq!(stored.stage, ReleaseStage::Pending);
    }
}
