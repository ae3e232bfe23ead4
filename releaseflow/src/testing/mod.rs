//! Test doubles and fixtures for exercising the orchestrator without
//! network access or real package indices.
//!
//! This module provides:
//! - In-memory artifact store, publisher, build step and report sink
//! - Builders for trigger events, result documents and configs

mod fakes;
mod fixtures;

pub use fakes::{
    CollectingReportSink, InMemoryArtifactStore, PublishAttempt, ScriptedPublisher,
    StaticBuildStep,
};
pub use fixtures::{fast_retry, results_json, test_config, workflow_event, workflow_run};
