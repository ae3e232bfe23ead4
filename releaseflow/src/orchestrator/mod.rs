//! Event dispatch, per-version serialization and preemption.
//!
//! The orchestrator routes each [`TriggerEvent`] to the correlator or the
//! release pipeline. Release events are serialized per [`JobKey`]: one
//! pipeline runs per version at a time. A newer event with a further goal
//! (a published release arriving while a tag push is still backing off)
//! cancels the running holder's token before queuing for the key.

#[cfg(test)]
mod integration_tests;

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn, Instrument, Level};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::cancellation::CancellationToken;
use crate::config::OrchestratorConfig;
use crate::core::{JobKey, JobStatus, ReleaseJob, ReleaseStage, TriggerEvent, TriggerKind};
use crate::correlator::{
    ArtifactStoreReportSink, CompositeReportSink, CorrelationOutcome, Correlator,
    LoggingReportSink, NoOpReason, NormalizedReport, ReportSink,
};
use crate::errors::{ConfigError, OrchestratorError, PipelineError, StoreError};
use crate::events::{EventKind, EventSink, LifecycleEvent, LoggingEventSink};
use crate::observability::event_span;
use crate::pipeline::{ArtifactVerifier, BuildStep, CommandBuildStep, ReleasePipeline};
use crate::publish::Publisher;
use crate::store::{InMemoryJobStore, JobStore};

/// Blob name used when reports are attached back to their run.
pub const REPORT_ARTIFACT_NAME: &str = "releaseflow-report.json";

/// What handling one event did.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// A test report was built and handed to the report sink.
    Reported(NormalizedReport),
    /// The event needed no work.
    NoOp(NoOpReason),
    /// The job moved forward.
    Advanced(ReleaseJob),
    /// The job was already at or past the event's goal, or is halted.
    Unchanged(ReleaseJob),
    /// A newer event took over before this one finished.
    Superseded {
        /// The job version.
        version: String,
        /// Who took over.
        reason: String,
    },
}

impl HandleOutcome {
    /// Short label for logs and CLI output.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reported(_) => "reported",
            Self::NoOp(_) => "noop",
            Self::Advanced(_) => "advanced",
            Self::Unchanged(_) => "unchanged",
            Self::Superseded { .. } => "superseded",
        }
    }

    /// The job this outcome carries, if any.
    #[must_use]
    pub fn job(&self) -> Option<&ReleaseJob> {
        match self {
            Self::Advanced(job) | Self::Unchanged(job) => Some(job),
            _ => None,
        }
    }

    /// Converts to a JSON summary.
    #[must_use]
    pub fn summary(&self) -> serde_json::Value {
        match self {
            Self::Reported(report) => json!({
                "outcome": self.label(),
                "commit": report.commit_sha,
                "run_id": report.run_id,
                "conclusion": report.conclusion,
                "totals": report.totals,
            }),
            Self::NoOp(reason) => json!({"outcome": self.label(), "reason": reason.to_string()}),
            Self::Advanced(job) | Self::Unchanged(job) => {
                json!({"outcome": self.label(), "job": job.summary()})
            }
            Self::Superseded { version, reason } => {
                json!({"outcome": self.label(), "version": version, "reason": reason})
            }
        }
    }
}

struct Claim {
    id: Uuid,
    goal: ReleaseStage,
    token: Arc<CancellationToken>,
}

/// Removes its claim from the registry when dropped.
///
/// The last claim on a key also removes the key's lock. Every lock holder
/// registers a claim first, so nobody can be holding it by then.
struct ClaimGuard<'a> {
    claims: &'a DashMap<JobKey, Vec<Claim>>,
    locks: &'a DashMap<JobKey, Arc<tokio::sync::Mutex<()>>>,
    key: JobKey,
    id: Uuid,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut held) = self.claims.get_mut(&self.key) {
            held.retain(|c| c.id != self.id);
        }
        self.claims.remove_if(&self.key, |key, held| {
            if held.is_empty() {
                self.locks.remove(key);
                true
            } else {
                false
            }
        });
    }
}

/// Routes trigger events to the correlator and the release pipeline.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    correlator: Correlator,
    pipeline: ReleasePipeline,
    reports: Arc<dyn ReportSink>,
    events: Arc<dyn EventSink>,
    locks: DashMap<JobKey, Arc<tokio::sync::Mutex<()>>>,
    claims: DashMap<JobKey, Vec<Claim>>,
    goals: DashMap<JobKey, ReleaseStage>,
}

impl Orchestrator {
    /// Starts building an orchestrator from `config`.
    #[must_use]
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Handles one delivery.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidEvent`] for unusable payloads,
    /// a correlation error, or the error that halted the release job.
    pub async fn handle(&self, event: &TriggerEvent) -> Result<HandleOutcome, OrchestratorError> {
        let span = event_span(event);
        async {
            let outcome = match event.kind {
                TriggerKind::WorkflowCompleted => self.handle_workflow(event).await,
                TriggerKind::TagPushed | TriggerKind::ReleasePublished => {
                    self.handle_release(event).await
                }
            };
            match &outcome {
                Ok(o) => info!(outcome = o.label(), "Event handled"),
                Err(e) => warn!(class = %e.class(), error = %e, "Event handling failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Handles a batch of deliveries concurrently.
    ///
    /// Events for distinct versions run in parallel and events for the same
    /// version are serialized. Results are returned in input order.
    pub async fn handle_all(
        &self,
        events: &[TriggerEvent],
    ) -> Vec<Result<HandleOutcome, OrchestratorError>> {
        join_all(events.iter().map(|event| self.handle(event))).await
    }

    /// Completion status of the job for `version`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the job could not be read.
    pub async fn status(&self, version: &str) -> Result<JobStatus, OrchestratorError> {
        Ok(self
            .store
            .get(&JobKey::new(version))
            .await?
            .map_or(JobStatus::Unknown, |job| job.status()))
    }

    /// Every known job, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns a store error if the jobs could not be read.
    pub async fn jobs(&self) -> Result<Vec<ReleaseJob>, OrchestratorError> {
        Ok(self.store.list().await?)
    }

    /// Restarts a halted job from the stage it failed in.
    ///
    /// Production uploads are never retried automatically; this is the
    /// operator's way to try again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] for an unknown version,
    /// [`OrchestratorError::NotRedrivable`] if the job is not `Failed`, or
    /// the error that halted the job again.
    pub async fn redrive(&self, version: &str) -> Result<HandleOutcome, OrchestratorError> {
        let key = JobKey::new(version);
        let current = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::Missing(key.to_string()))?;
        let goal = self.redrive_goal(&current);

        let (token, _claim) = self.claim(&key, goal, "operator redrive");
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let job = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::Missing(key.to_string()))?;
        if job.stage != ReleaseStage::Failed {
            return Err(OrchestratorError::NotRedrivable {
                version: job.version,
                stage: job.stage,
            });
        }

        let job = self.pipeline.redrive(&job).await?;
        self.run(job, goal, &token).await
    }

    async fn handle_workflow(&self, event: &TriggerEvent) -> Result<HandleOutcome, OrchestratorError> {
        let token = CancellationToken::new();
        match self.correlator.correlate(event, &token).await? {
            CorrelationOutcome::Report(report) => {
                let delivered = match self.reports.publish_report(&report).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(run_id = report.run_id, error = %e, "Report delivery failed");
                        false
                    }
                };
                self.events
                    .emit(
                        LifecycleEvent::new(EventKind::ReportPublished)
                            .with_key(report.commit_sha.clone())
                            .with_data(json!({
                                "run_id": report.run_id,
                                "event_name": report.event_name,
                                "conclusion": report.conclusion,
                                "headline": report.headline(),
                                "delivered": delivered,
                            })),
                    )
                    .await;
                Ok(HandleOutcome::Reported(report))
            }
            CorrelationOutcome::NoOp(reason) => {
                self.events
                    .emit(
                        LifecycleEvent::new(EventKind::ReportSkipped)
                            .with_key(event.source_commit.clone())
                            .with_data(json!({
                                "run_id": event.upstream_run_id,
                                "reason": reason.to_string(),
                            })),
                    )
                    .await;
                Ok(HandleOutcome::NoOp(reason))
            }
        }
    }

    async fn handle_release(&self, event: &TriggerEvent) -> Result<HandleOutcome, OrchestratorError> {
        let version = event
            .version()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                OrchestratorError::InvalidEvent(format!(
                    "{} delivery {} names no tag or version",
                    event.kind, event.delivery_id
                ))
            })?;
        let commit = event.source_commit.trim();
        if commit.is_empty() {
            return Err(OrchestratorError::InvalidEvent(format!(
                "{} delivery {} carries no commit",
                event.kind, event.delivery_id
            )));
        }

        let key = JobKey::new(&version);
        let goal = if event.kind == TriggerKind::ReleasePublished {
            ReleaseStage::Promoted
        } else {
            ReleaseStage::StagedPublished
        };
        let (token, _claim) = self.claim(
            &key,
            goal,
            &format!("{} delivery {}", event.kind, event.delivery_id),
        );

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;
        if token.is_cancelled() {
            let reason = token.reason().unwrap_or_default();
            info!(version = %key, reason = %reason, "Superseded while waiting for the job");
            return Ok(HandleOutcome::Superseded {
                version: key.to_string(),
                reason,
            });
        }

        let (job, created) = self
            .store
            .insert_if_absent(ReleaseJob::new(key.as_str(), commit, event.kind))
            .await?;
        if created {
            info!(version = %job.version, commit = %job.commit, trigger = %job.trigger, "Release job created");
            self.events
                .emit(
                    LifecycleEvent::new(EventKind::JobCreated)
                        .with_key(key.to_string())
                        .with_data(job.summary()),
                )
                .await;
        }
        if job.commit != commit {
            return Err(OrchestratorError::InvalidEvent(format!(
                "version {} is bound to commit {}, delivery {} carries {commit}",
                job.version, job.commit, event.delivery_id
            )));
        }
        self.record_goal(&job, goal);

        if job.stage == ReleaseStage::Failed {
            info!(version = %job.version, "Job is halted; re-drive it to continue");
            return Ok(HandleOutcome::Unchanged(job));
        }
        if job.stage.has_reached(goal) {
            info!(version = %job.version, stage = %job.stage, goal = %goal, "Job already reached goal");
            return Ok(HandleOutcome::Unchanged(job));
        }

        self.run(job, goal, &token).await
    }

    async fn run(
        &self,
        job: ReleaseJob,
        goal: ReleaseStage,
        token: &CancellationToken,
    ) -> Result<HandleOutcome, OrchestratorError> {
        let version = job.version.clone();
        match self.pipeline.drive(job, goal, token).await {
            Ok(job) => {
                if job.stage == ReleaseStage::Promoted {
                    self.goals.remove(&job.key());
                }
                Ok(HandleOutcome::Advanced(job))
            }
            Err(PipelineError::Superseded(reason)) => Ok(HandleOutcome::Superseded { version, reason }),
            Err(e) => Err(e.into()),
        }
    }

    /// Registers a claim on `key`, cancelling every claim with a nearer goal.
    fn claim(
        &self,
        key: &JobKey,
        goal: ReleaseStage,
        holder: &str,
    ) -> (Arc<CancellationToken>, ClaimGuard<'_>) {
        let token = Arc::new(CancellationToken::new());
        let id = Uuid::new_v4();
        let mut held = self.claims.entry(key.clone()).or_default();
        for other in held.iter().filter(|c| !c.goal.has_reached(goal)) {
            info!(version = %key, goal = %goal, "Preempting in-flight {} run", other.goal);
            other.token.cancel(format!("superseded by {holder}"));
        }
        held.push(Claim {
            id,
            goal,
            token: token.clone(),
        });
        drop(held);

        let guard = ClaimGuard {
            claims: &self.claims,
            locks: &self.locks,
            key: key.clone(),
            id,
        };
        (token, guard)
    }

    fn lock_for(&self, key: &JobKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// Remembers a pending promotion the job's own trigger does not imply.
    fn record_goal(&self, job: &ReleaseJob, goal: ReleaseStage) {
        if goal == ReleaseStage::Promoted
            && job.trigger != TriggerKind::ReleasePublished
            && job.stage != ReleaseStage::Promoted
        {
            self.goals.insert(job.key(), goal);
        }
    }

    /// The furthest stage any delivery asked this job to reach.
    fn redrive_goal(&self, job: &ReleaseJob) -> ReleaseStage {
        let requested = self.goals.get(&job.key()).map(|g| *g);
        if job.trigger == TriggerKind::ReleasePublished
            || job.failed_from == Some(ReleaseStage::StagedPublished)
            || requested == Some(ReleaseStage::Promoted)
        {
            ReleaseStage::Promoted
        } else {
            ReleaseStage::StagedPublished
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.pipeline)
            .field("active_keys", &self.claims.len())
            .field("pending_promotions", &self.goals.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Orchestrator`].
///
/// An artifact store and a publisher are required; everything else falls
/// back to a default derived from the configuration.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn JobStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    publisher: Option<Arc<dyn Publisher>>,
    build: Option<Arc<dyn BuildStep>>,
    reports: Option<Arc<dyn ReportSink>>,
    events: Option<Arc<dyn EventSink>>,
}

impl OrchestratorBuilder {
    /// Creates a builder from `config`.
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            artifacts: None,
            publisher: None,
            build: None,
            reports: None,
            events: None,
        }
    }

    /// Sets the job store. Defaults to an in-memory store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the artifact store client.
    #[must_use]
    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Sets the package index publisher.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Sets the build step. Defaults to running the configured command.
    #[must_use]
    pub fn with_build_step(mut self, build: Arc<dyn BuildStep>) -> Self {
        self.build = Some(build);
        self
    }

    /// Sets the report sink. Defaults to logging, plus attaching the report
    /// to its run when `correlator.attach_report` is set.
    #[must_use]
    pub fn with_report_sink(mut self, reports: Arc<dyn ReportSink>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Sets the lifecycle event sink. Defaults to logging.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid or a
    /// required collaborator is missing.
    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        let config = self.config;
        config.validate()?;

        let artifacts = self.artifacts.ok_or_else(|| missing("artifacts", "an artifact store"))?;
        let publisher = self.publisher.ok_or_else(|| missing("publish", "a publisher"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let build = self
            .build
            .unwrap_or_else(|| Arc::new(CommandBuildStep::new(config.build.clone())));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(LoggingEventSink::new(Level::INFO)));
        let reports = self.reports.unwrap_or_else(|| {
            let mut sinks = CompositeReportSink::new().with_sink(Arc::new(LoggingReportSink));
            if config.correlator.attach_report {
                sinks = sinks.with_sink(Arc::new(ArtifactStoreReportSink::new(
                    artifacts.clone(),
                    REPORT_ARTIFACT_NAME,
                )));
            }
            Arc::new(sinks)
        });

        let correlator = Correlator::from_config(artifacts, &config.correlator, config.retry.clone())?;
        let pipeline = ReleasePipeline::new(store.clone(), build, publisher)
            .with_verifier(ArtifactVerifier::new(&config.verify))
            .with_event_sink(events.clone())
            .with_staging_retry(config.retry.clone());

        info!(
            pattern = %correlator.pattern().as_str(),
            max_attempts = config.retry.max_attempts,
            "Orchestrator ready"
        );
        Ok(Orchestrator {
            store,
            correlator,
            pipeline,
            reports,
            events,
            locks: DashMap::new(),
            claims: DashMap::new(),
            goals: DashMap::new(),
        })
    }
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("has_artifact_store", &self.artifacts.is_some())
            .field("has_publisher", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

fn missing(field: &str, what: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: format!("{what} is required"),
    }
}
