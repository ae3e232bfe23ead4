//! The release pipeline.
//!
//! This module provides:
//! - The pure job state machine ([`transition`])
//! - Build steps and artifact verification
//! - Bounded retry with backoff and cancellation
//! - [`ReleasePipeline`], which drives jobs through their stages

mod build;
mod release;
mod retry;
mod transition;
mod verify;

pub use build::{BuildStep, CommandBuildStep, ENV_RELEASE_COMMIT, ENV_RELEASE_VERSION};
pub use release::ReleasePipeline;
pub use retry::{
    sleep_unless_cancelled, with_retry, with_retry_notify, BackoffStrategy, Classify,
    JitterStrategy, RetryConfig, RetryDecision, RetryFailure, RetryPolicy, RetryState,
};
pub use transition::{transition, Step};
pub use verify::{ArtifactVerifier, ARTIFACT_EXTENSIONS};
