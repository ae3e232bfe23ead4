//! Normalized test reports and the surfaces they are published to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::artifacts::ArtifactStore;
use crate::core::Conclusion;
use crate::errors::ReportError;

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    /// The test passed.
    Passed,
    /// An assertion failed.
    Failed,
    /// The test did not run.
    Skipped,
    /// The test crashed or its fixture failed.
    Errored,
}

/// One test case as written by the upstream run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Fully qualified test name.
    pub name: String,
    /// Outcome.
    pub outcome: TestOutcome,
    /// Duration, when recorded.
    #[serde(default)]
    pub duration_ms: Option<f64>,
    /// Failure message, when recorded.
    #[serde(default)]
    pub message: Option<String>,
}

/// The result-file document inside a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResultDocument {
    /// All recorded test cases.
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

/// Outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    /// Passed tests.
    pub passed: u64,
    /// Failed tests.
    pub failed: u64,
    /// Skipped tests.
    pub skipped: u64,
    /// Errored tests.
    pub errored: u64,
}

impl TestCounts {
    /// Counts the outcomes in `cases`.
    #[must_use]
    pub fn from_cases(cases: &[TestCase]) -> Self {
        let mut counts = Self::default();
        for case in cases {
            counts.record(case.outcome);
        }
        counts
    }

    /// Adds one outcome.
    pub fn record(&mut self, outcome: TestOutcome) {
        match outcome {
            TestOutcome::Passed => self.passed += 1,
            TestOutcome::Failed => self.failed += 1,
            TestOutcome::Skipped => self.skipped += 1,
            TestOutcome::Errored => self.errored += 1,
        }
    }

    /// Adds another set of counts.
    pub fn merge(&mut self, other: &Self) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errored += other.errored;
    }

    /// Total test cases.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.passed + self.failed + self.skipped + self.errored
    }

    /// Returns true if any test failed or errored.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.errored > 0
    }
}

/// Per-bundle section of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSummary {
    /// Bundle name.
    pub name: String,
    /// Outcome counts.
    pub counts: TestCounts,
    /// Names of failed or errored tests.
    pub failing: Vec<String>,
}

/// A unified test-result summary derived from one upstream run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedReport {
    /// Commit the upstream run tested.
    pub commit_sha: String,
    /// Event that started the upstream run.
    pub event_name: String,
    /// Upstream run id.
    pub run_id: u64,
    /// Conclusion reported by the upstream run.
    pub run_conclusion: Conclusion,
    /// Conclusion derived from the parsed results.
    pub conclusion: Conclusion,
    /// Sum over all bundles.
    pub totals: TestCounts,
    /// Per-bundle breakdown, in listing order.
    pub bundles: Vec<BundleSummary>,
    /// Bundles whose result file could not be parsed.
    pub unparsed_bundles: Vec<String>,
    /// When the report was built.
    pub generated_at: DateTime<Utc>,
}

impl NormalizedReport {
    /// Starts an empty report for a run.
    #[must_use]
    pub fn new(
        commit_sha: impl Into<String>,
        event_name: impl Into<String>,
        run_id: u64,
        run_conclusion: Conclusion,
    ) -> Self {
        Self {
            commit_sha: commit_sha.into(),
            event_name: event_name.into(),
            run_id,
            run_conclusion,
            conclusion: Conclusion::Success,
            totals: TestCounts::default(),
            bundles: Vec::new(),
            unparsed_bundles: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    /// Adds a parsed bundle.
    pub fn add_bundle(&mut self, name: impl Into<String>, document: &TestResultDocument) {
        let counts = TestCounts::from_cases(&document.tests);
        let failing = document
            .tests
            .iter()
            .filter(|t| matches!(t.outcome, TestOutcome::Failed | TestOutcome::Errored))
            .map(|t| t.name.clone())
            .collect();
        self.totals.merge(&counts);
        if counts.has_failures() {
            self.conclusion = Conclusion::Failure;
        }
        self.bundles.push(BundleSummary {
            name: name.into(),
            counts,
            failing,
        });
    }

    /// Records a bundle that could not be parsed.
    pub fn add_unparsed(&mut self, name: impl Into<String>) {
        self.unparsed_bundles.push(name.into());
    }

    /// All failing test names across bundles.
    #[must_use]
    pub fn failing_tests(&self) -> Vec<&str> {
        self.bundles
            .iter()
            .flat_map(|b| b.failing.iter().map(String::as_str))
            .collect()
    }

    /// One-line human summary.
    #[must_use]
    pub fn headline(&self) -> String {
        format!(
            "{} tests: {} passed, {} failed, {} errored, {} skipped ({} bundles, {} unparsed)",
            self.totals.total(),
            self.totals.passed,
            self.totals.failed,
            self.totals.errored,
            self.totals.skipped,
            self.bundles.len(),
            self.unparsed_bundles.len()
        )
    }
}

/// A place normalized reports are delivered to.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Delivers a report. Callers log failures and carry on.
    async fn publish_report(&self, report: &NormalizedReport) -> Result<(), ReportError>;
}

/// Writes reports to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReportSink;

#[async_trait]
impl ReportSink for LoggingReportSink {
    async fn publish_report(&self, report: &NormalizedReport) -> Result<(), ReportError> {
        info!(
            commit = %report.commit_sha,
            event = %report.event_name,
            run_id = report.run_id,
            conclusion = %report.conclusion,
            "{}",
            report.headline()
        );
        Ok(())
    }
}

/// Attaches the report as a JSON blob to the run it describes.
pub struct ArtifactStoreReportSink {
    store: Arc<dyn ArtifactStore>,
    name: String,
}

impl ArtifactStoreReportSink {
    /// Creates a sink uploading to `store` under the blob name `name`.
    #[must_use]
    pub fn new(store: Arc<dyn ArtifactStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

impl std::fmt::Debug for ArtifactStoreReportSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStoreReportSink")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ReportSink for ArtifactStoreReportSink {
    async fn publish_report(&self, report: &NormalizedReport) -> Result<(), ReportError> {
        let body = serde_json::to_vec_pretty(report)
            .map_err(|e| ReportError::new("artifact-store", e.to_string()))?;
        self.store
            .upload(report.run_id, &self.name, body)
            .await
            .map_err(|e| ReportError::new("artifact-store", e.to_string()))?;
        Ok(())
    }
}

/// Fans a report out to several sinks.
///
/// Every sink is attempted; the first error is returned.
#[derive(Default)]
pub struct CompositeReportSink {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl CompositeReportSink {
    /// Creates an empty composite.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl ReportSink for CompositeReportSink {
    async fn publish_report(&self, report: &NormalizedReport) -> Result<(), ReportError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish_report(report).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryArtifactStore;
    use pretty_assertions::assert_eq;

    fn case(name: &str, outcome: TestOutcome) -> TestCase {
        TestCase {
            name: name.to_string(),
            outcome,
            duration_ms: None,
            message: None,
        }
    }

    #[test]
    fn test_report_aggregation() {
        let mut report = NormalizedReport::new("abc", "pull_request", 7, Conclusion::Failure);
        report.add_bundle(
            "unit",
            &TestResultDocument {
                tests: vec![case("a", TestOutcome::Passed), case("b", TestOutcome::Skipped)],
            },
        );
        assert_eq!(report.conclusion, Conclusion::Success);

        report.add_bundle(
            "integration",
            &TestResultDocument {
                tests: vec![case("c", TestOutcome::Failed), case("d", TestOutcome::Errored)],
            },
        );
        report.add_unparsed("broken");

        assert_eq!(
            report.totals,
            TestCounts {
                passed: 1,
                failed: 1,
                skipped: 1,
                errored: 1
            }
        );
        assert_eq!(report.conclusion, Conclusion::Failure);
        assert_eq!(report.failing_tests(), vec!["c", "d"]);
        assert_eq!(
            report.headline(),
            "4 tests: 1 passed, 1 failed, 1 errored, 1 skipped (2 bundles, 1 unparsed)"
        );
    }

    #[tokio::test]
    async fn test_artifact_store_sink_uploads_json() {
        let store = Arc::new(InMemoryArtifactStore::new());
        let sink = ArtifactStoreReportSink::new(store.clone(), "normalized-report.json");
        let report = NormalizedReport::new("abc", "push", 11, Conclusion::Success);

        sink.publish_report(&report).await.unwrap();

        let uploaded = store.blob(11, "normalized-report.json").unwrap();
        let back: NormalizedReport = serde_json::from_slice(&uploaded).unwrap();
        assert_eq!(back, report);
    }

    #[tokio::test]
    async fn test_composite_attempts_every_sink() {
        let store = Arc::new(InMemoryArtifactStore::new());
        store.fail_uploads(true);
        let collecting = Arc::new(crate::testing::CollectingReportSink::new());
        let composite = CompositeReportSink::new()
            .with_sink(Arc::new(ArtifactStoreReportSink::new(store, "r.json")))
            .with_sink(collecting.clone());

        let report = NormalizedReport::new("abc", "push", 1, Conclusion::Success);
        assert!(composite.publish_report(&report).await.is_err());
        assert_eq!(collecting.reports().len(), 1);
    }
}
