//! Test-result correlation for completed upstream runs.
//!
//! A completed CI run publishes test results as artifact bundles. The
//! correlator lists the run's artifacts, keeps the bundles whose names match
//! the configured glob, unpacks each into a scratch area private to the
//! delivery and folds the parsed results into a [`NormalizedReport`] keyed
//! by the run's commit and triggering event name.

mod pattern;
mod report;
mod unpack;

pub use pattern::ResultPattern;
pub use report::{
    ArtifactStoreReportSink, BundleSummary, CompositeReportSink, LoggingReportSink,
    NormalizedReport, ReportSink, TestCase, TestCounts, TestOutcome, TestResultDocument,
};
pub use unpack::{decode_blob, is_gzip, sanitize_bundle_name, ScratchArea, RESULT_FILE_NAME};

use futures::future::try_join_all;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactStore;
use crate::cancellation::CancellationToken;
use crate::config::CorrelatorConfig;
use crate::core::{ArtifactBundle, ArtifactRef, Conclusion, TriggerEvent, WorkflowRun};
use crate::errors::{ConfigError, CorrelationError};
use crate::pipeline::{with_retry, RetryConfig, RetryPolicy};

/// Why a correlation produced no report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// The upstream run was skipped.
    Skipped,
    /// No artifact matched the result pattern.
    NoTestResults,
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped"),
            Self::NoTestResults => write!(f, "no_test_results"),
        }
    }
}

/// Result of correlating one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// A report was built.
    Report(NormalizedReport),
    /// Nothing to report.
    NoOp(NoOpReason),
}

impl CorrelationOutcome {
    /// Returns the report, if one was built.
    #[must_use]
    pub fn report(&self) -> Option<&NormalizedReport> {
        match self {
            Self::Report(report) => Some(report),
            Self::NoOp(_) => None,
        }
    }
}

/// Correlates completed upstream runs with their test results.
pub struct Correlator {
    store: Arc<dyn ArtifactStore>,
    pattern: ResultPattern,
    scratch_root: PathBuf,
    keep_scratch: bool,
    listing_policy: RetryPolicy,
}

impl Correlator {
    /// Creates a correlator with default scratch and retry settings.
    #[must_use]
    pub fn new(store: Arc<dyn ArtifactStore>, pattern: ResultPattern) -> Self {
        let defaults = CorrelatorConfig::default();
        Self {
            store,
            pattern,
            scratch_root: defaults.scratch_dir,
            keep_scratch: defaults.keep_scratch,
            listing_policy: RetryPolicy::transient(RetryConfig::default()),
        }
    }

    /// Creates a correlator from configuration.
    pub fn from_config(
        store: Arc<dyn ArtifactStore>,
        config: &CorrelatorConfig,
        retry: RetryConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(store, ResultPattern::new(&config.result_pattern)?)
            .with_scratch_root(config.scratch_dir.clone())
            .with_keep_scratch(config.keep_scratch)
            .with_listing_policy(RetryPolicy::transient(retry)))
    }

    /// Sets the scratch root.
    #[must_use]
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    /// Keeps unpacked bundles after correlation.
    #[must_use]
    pub fn with_keep_scratch(mut self, keep: bool) -> Self {
        self.keep_scratch = keep;
        self
    }

    /// Sets the retry policy for store calls.
    #[must_use]
    pub fn with_listing_policy(mut self, policy: RetryPolicy) -> Self {
        self.listing_policy = policy;
        self
    }

    /// The configured result pattern.
    #[must_use]
    pub fn pattern(&self) -> &ResultPattern {
        &self.pattern
    }

    /// Correlates `event` with the test results of its upstream run.
    pub async fn correlate(
        &self,
        event: &TriggerEvent,
        token: &CancellationToken,
    ) -> Result<CorrelationOutcome, CorrelationError> {
        let run = event.workflow_run().ok_or_else(|| {
            CorrelationError::MissingRun(format!(
                "delivery {} carries no workflow_run",
                event.delivery_id
            ))
        })?;

        if run.conclusion == Conclusion::Skipped {
            info!(run_id = run.id, commit = %run.head_commit, "Upstream run skipped, nothing to correlate");
            return Ok(CorrelationOutcome::NoOp(NoOpReason::Skipped));
        }

        let listed = self.list_artifacts(run.id, token).await?;
        let total = listed.len();
        let matched = self.pattern.filter(listed);
        debug!(
            run_id = run.id,
            listed = total,
            matched = matched.len(),
            pattern = %self.pattern.as_str(),
            "Filtered run artifacts"
        );

        if matched.is_empty() {
            info!(run_id = run.id, pattern = %self.pattern.as_str(), "No test-result bundles found");
            return Ok(CorrelationOutcome::NoOp(NoOpReason::NoTestResults));
        }

        let scratch = ScratchArea::new(&self.scratch_root, run.id);
        let result = self.build_report(event, &run, matched, &scratch, token).await;

        if !self.keep_scratch {
            if let Err(e) = scratch.remove().await {
                warn!(path = %scratch.root().display(), error = %e, "Failed to remove scratch area");
            }
        }

        result.map(CorrelationOutcome::Report)
    }

    async fn list_artifacts(
        &self,
        run_id: u64,
        token: &CancellationToken,
    ) -> Result<Vec<ArtifactRef>, CorrelationError> {
        let key = format!("list:{run_id}");
        with_retry(&self.listing_policy, &key, token, |_| self.store.list(run_id))
            .await
            .map_err(|failure| CorrelationError::ArtifactsUnavailable {
                run_id,
                source: failure.into_error(),
            })
    }

    async fn fetch_bundle(
        &self,
        index: usize,
        artifact: ArtifactRef,
        scratch: &ScratchArea,
        token: &CancellationToken,
    ) -> Result<ArtifactBundle, CorrelationError> {
        let key = format!("download:{}:{}", artifact.run_id, artifact.name);
        let blob = with_retry(&self.listing_policy, &key, token, |_| self.store.download(&artifact))
            .await
            .map_err(|failure| CorrelationError::Download {
                bundle: artifact.name.clone(),
                source: failure.into_error(),
            })?;

        let extracted_path = scratch
            .unpack(index, &artifact.name, blob)
            .await
            .map_err(|source| CorrelationError::Unpack {
                bundle: artifact.name.clone(),
                source,
            })?;

        Ok(ArtifactBundle {
            name: artifact.name,
            download_url: artifact.download_url,
            extracted_path,
        })
    }

    async fn build_report(
        &self,
        event: &TriggerEvent,
        run: &WorkflowRun,
        matched: Vec<ArtifactRef>,
        scratch: &ScratchArea,
        token: &CancellationToken,
    ) -> Result<NormalizedReport, CorrelationError> {
        let bundles = try_join_all(
            matched
                .into_iter()
                .enumerate()
                .map(|(index, artifact)| self.fetch_bundle(index, artifact, scratch, token)),
        )
        .await?;

        let commit = if run.head_commit.is_empty() {
            event.source_commit.clone()
        } else {
            run.head_commit.clone()
        };
        let mut report = NormalizedReport::new(commit, run.event_name.clone(), run.id, run.conclusion);

        for bundle in &bundles {
            let path = bundle.extracted_path.join(RESULT_FILE_NAME);
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<TestResultDocument>(&bytes).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(document) => report.add_bundle(bundle.name.clone(), &document),
                Err(e) => {
                    warn!(run_id = run.id, bundle = %bundle.name, error = %e, "Unparsable test-result bundle");
                    report.add_unparsed(bundle.name.clone());
                }
            }
        }

        info!(
            run_id = run.id,
            commit = %report.commit_sha,
            conclusion = %report.conclusion,
            "{}",
            report.headline()
        );
        Ok(report)
    }
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pattern", &self.pattern.as_str())
            .field("scratch_root", &self.scratch_root)
            .field("keep_scratch", &self.keep_scratch)
            .finish_non_exhaustive()
    }
}
