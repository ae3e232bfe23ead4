//! Builders for events, result documents and configs used in tests.

use std::path::Path;

use crate::config::OrchestratorConfig;
use crate::core::{Conclusion, TriggerEvent, WorkflowRun};
use crate::correlator::{TestCase, TestOutcome, TestResultDocument};
use crate::pipeline::{BackoffStrategy, JitterStrategy, RetryConfig};

/// A completed upstream run.
#[must_use]
pub fn workflow_run(id: u64, conclusion: Conclusion, commit: &str) -> WorkflowRun {
    WorkflowRun {
        id,
        conclusion,
        head_commit: commit.to_string(),
        event_name: "push".to_string(),
    }
}

/// A workflow-completed event for `run`.
#[must_use]
pub fn workflow_event(run: &WorkflowRun) -> TriggerEvent {
    TriggerEvent::workflow_completed(run)
}

/// Serialized result document with one case per `(name, outcome)`.
#[must_use]
pub fn results_json(cases: &[(&str, TestOutcome)]) -> Vec<u8> {
    let doc = TestResultDocument {
        tests: cases
            .iter()
            .map(|(name, outcome)| TestCase {
                name: (*name).to_string(),
                outcome: *outcome,
                duration_ms: Some(1.0),
                message: None,
            })
            .collect(),
    };
    serde_json::to_vec(&doc).unwrap_or_default()
}

/// Retry settings with one-millisecond delays and no jitter.
#[must_use]
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 5,
        backoff_strategy: BackoffStrategy::Exponential,
        jitter_strategy: JitterStrategy::None,
    }
}

/// Config with fast retries and scratch space under `scratch`.
#[must_use]
pub fn test_config(scratch: &Path, max_attempts: u32) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_retry(fast_retry(max_attempts))
        .with_scratch_dir(scratch)
}
