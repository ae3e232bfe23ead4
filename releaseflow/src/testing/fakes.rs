//! In-memory fakes for the orchestrator's external collaborators.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::artifacts::ArtifactStore;
use crate::core::{ArtifactRef, LoadedArtifact, ReleaseJob};
use crate::correlator::{NormalizedReport, ReportSink};
use crate::errors::{ArtifactStoreError, BuildError, PublishError, ReportError};
use crate::pipeline::BuildStep;
use crate::publish::{PublishTarget, Publisher};

/// Artifact store holding blobs in memory, keyed by run id.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    runs: Mutex<BTreeMap<u64, Vec<(String, Vec<u8>)>>>,
    listing_failures: Mutex<VecDeque<ArtifactStoreError>>,
    always_fail_listing: Mutex<Option<ArtifactStoreError>>,
    fail_uploads: Mutex<bool>,
    list_calls: AtomicUsize,
    download_calls: AtomicUsize,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artifact to a run, after any existing ones.
    pub fn add_artifact(&self, run_id: u64, name: impl Into<String>, content: Vec<u8>) {
        self.runs
            .lock()
            .entry(run_id)
            .or_default()
            .push((name.into(), content));
    }

    /// Returns the blob stored under `name` for `run_id`.
    #[must_use]
    pub fn blob(&self, run_id: u64, name: &str) -> Option<Vec<u8>> {
        self.runs
            .lock()
            .get(&run_id)?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, content)| content.clone())
    }

    /// Makes every listing call fail with `error`.
    pub fn fail_listing_with(&self, error: ArtifactStoreError) {
        *self.always_fail_listing.lock() = Some(error);
    }

    /// Makes the next `times` listing calls fail with `error`.
    pub fn fail_next_listings(&self, times: usize, error: ArtifactStoreError) {
        let mut failures = self.listing_failures.lock();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    /// Makes uploads fail.
    pub fn fail_uploads(&self, fail: bool) {
        *self.fail_uploads.lock() = fail;
    }

    /// Number of listing calls made.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of download calls made.
    #[must_use]
    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    fn url(run_id: u64, name: &str) -> String {
        format!("memory://runs/{run_id}/{name}")
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn list(&self, run_id: u64) -> Result<Vec<ArtifactRef>, ArtifactStoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.always_fail_listing.lock().clone() {
            return Err(error);
        }
        if let Some(error) = self.listing_failures.lock().pop_front() {
            return Err(error);
        }

        Ok(self
            .runs
            .lock()
            .get(&run_id)
            .map(|artifacts| {
                artifacts
                    .iter()
                    .map(|(name, content)| ArtifactRef {
                        run_id,
                        name: name.clone(),
                        download_url: Self::url(run_id, name),
                        size_bytes: Some(content.len() as u64),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn download(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ArtifactStoreError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.blob(artifact.run_id, &artifact.name)
            .ok_or_else(|| ArtifactStoreError::NotFound(artifact.download_url.clone()))
    }

    async fn upload(
        &self,
        run_id: u64,
        name: &str,
        content: Vec<u8>,
    ) -> Result<ArtifactRef, ArtifactStoreError> {
        if *self.fail_uploads.lock() {
            return Err(ArtifactStoreError::Unreachable("uploads disabled".to_string()));
        }
        let size = content.len() as u64;
        let mut runs = self.runs.lock();
        let artifacts = runs.entry(run_id).or_default();
        artifacts.retain(|(n, _)| n != name);
        artifacts.push((name.to_string(), content));
        Ok(ArtifactRef {
            run_id,
            name: name.to_string(),
            download_url: Self::url(run_id, name),
            size_bytes: Some(size),
        })
    }
}

/// A recorded publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAttempt {
    /// Target index.
    pub target: PublishTarget,
    /// Version uploaded.
    pub version: String,
    /// Uploaded bytes.
    pub content: Vec<u8>,
    /// Whether the scripted outcome was a success.
    pub succeeded: bool,
}

/// Publisher that returns scripted outcomes and records every attempt.
///
/// Once a target's script is exhausted, uploads to it succeed.
#[derive(Debug, Default)]
pub struct ScriptedPublisher {
    scripts: Mutex<HashMap<PublishTarget, VecDeque<PublishError>>>,
    always_fail: Mutex<HashMap<PublishTarget, PublishError>>,
    attempts: Mutex<Vec<PublishAttempt>>,
    delay: Option<Duration>,
}

impl ScriptedPublisher {
    /// Creates a publisher on which every upload succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits `delay` inside every upload.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fails the next `times` uploads to `target` with `error`.
    pub fn fail_times(&self, target: PublishTarget, times: usize, error: PublishError) {
        let mut scripts = self.scripts.lock();
        let queue = scripts.entry(target).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Fails every upload to `target` with `error`.
    pub fn fail_always(&self, target: PublishTarget, error: PublishError) {
        self.always_fail.lock().insert(target, error);
    }

    /// Lets uploads to `target` succeed again.
    pub fn recover(&self, target: PublishTarget) {
        self.always_fail.lock().remove(&target);
        self.scripts.lock().remove(&target);
    }

    /// Every attempt, in order.
    #[must_use]
    pub fn attempts(&self) -> Vec<PublishAttempt> {
        self.attempts.lock().clone()
    }

    /// Number of attempts against `target`.
    #[must_use]
    pub fn calls(&self, target: PublishTarget) -> usize {
        self.attempts.lock().iter().filter(|a| a.target == target).count()
    }

    /// Contents successfully uploaded to `target`.
    #[must_use]
    pub fn uploaded(&self, target: PublishTarget) -> Vec<Vec<u8>> {
        self.attempts
            .lock()
            .iter()
            .filter(|a| a.target == target && a.succeeded)
            .map(|a| a.content.clone())
            .collect()
    }

    fn next_outcome(&self, target: PublishTarget) -> Result<(), PublishError> {
        if let Some(error) = self.always_fail.lock().get(&target) {
            return Err(error.clone());
        }
        match self.scripts.lock().get_mut(&target).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(
        &self,
        target: PublishTarget,
        version: &str,
        artifact: &LoadedArtifact,
    ) -> Result<(), PublishError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self.next_outcome(target);
        self.attempts.lock().push(PublishAttempt {
            target,
            version: version.to_string(),
            content: artifact.content.clone(),
            succeeded: outcome.is_ok(),
        });
        outcome
    }
}

/// Build step that returns a synthetic artifact without running anything.
#[derive(Debug)]
pub struct StaticBuildStep {
    package: String,
    file_name: Option<String>,
    output_dir: Option<PathBuf>,
    failure: Option<String>,
    calls: AtomicUsize,
}

impl StaticBuildStep {
    /// Builds `<package>-<version>.tar.gz` for every job.
    #[must_use]
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            file_name: None,
            output_dir: None,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails every build with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        let mut step = Self::new("package");
        step.failure = Some(message.into());
        step
    }

    /// Uses a fixed artifact file name instead of the derived one.
    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Writes every artifact into `dir` so it can be read back later.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Number of builds run.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildStep for StaticBuildStep {
    async fn build(&self, job: &ReleaseJob) -> Result<LoadedArtifact, BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref message) = self.failure {
            return Err(BuildError::new(&job.version, message.clone()).with_exit_code(1));
        }
        let file_name = self
            .file_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}.tar.gz", self.package, job.version));
        let content = format!("{} {} built from {}", self.package, job.version, job.commit).into_bytes();

        let Some(ref dir) = self.output_dir else {
            return Ok(LoadedArtifact::from_content(&self.package, file_name, content));
        };
        let path = dir.join(&file_name);
        let written = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, &content).await
        };
        written
            .await
            .map_err(|e| BuildError::new(&job.version, format!("cannot write {}: {e}", path.display())))?;
        Ok(LoadedArtifact::from_content(&self.package, file_name, content).with_path(path))
    }
}

/// Report sink that keeps every report in memory.
#[derive(Debug, Default)]
pub struct CollectingReportSink {
    reports: Mutex<Vec<NormalizedReport>>,
    fail: Mutex<bool>,
}

impl CollectingReportSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes delivery fail after recording the report.
    pub fn fail_deliveries(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Reports received so far.
    #[must_use]
    pub fn reports(&self) -> Vec<NormalizedReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl ReportSink for CollectingReportSink {
    async fn publish_report(&self, report: &NormalizedReport) -> Result<(), ReportError> {
        self.reports.lock().push(report.clone());
        if *self.fail.lock() {
            return Err(ReportError::new("collecting", "delivery disabled"));
        }
        Ok(())
    }
}
