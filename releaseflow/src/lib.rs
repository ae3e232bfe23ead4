//! # Releaseflow
//!
//! Event-driven CI artifact correlation and staged release orchestration.
//!
//! Releaseflow reacts to three kinds of trigger:
//!
//! - **Completed workflow runs**: test-result bundles attached to the run are
//!   downloaded, parsed and folded into one report per commit
//! - **Pushed tags**: the tagged commit is built, verified and uploaded to a
//!   staging package index
//! - **Published releases**: the staged artifact is promoted to the
//!   production index
//!
//! Each release version is tracked by a persisted job whose stages only
//! change through a pure transition function and a compare-and-swap store
//! write. Staging uploads retry transient failures with bounded backoff;
//! production uploads never retry on their own.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use releaseflow::prelude::*;
//!
//! let orchestrator = Orchestrator::builder(OrchestratorConfig::load("releaseflow.toml")?)
//!     .with_artifact_store(artifacts)
//!     .with_publisher(publisher)
//!     .build()?;
//!
//! let outcome = orchestrator
//!     .handle(&TriggerEvent::tag_pushed("v1.2.3", "4f2a9c1"))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

pub mod artifacts;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod correlator;
pub mod errors;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod publish;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::ArtifactStore;
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::OrchestratorConfig;
    pub use crate::core::{
        JobKey, JobStatus, ReleaseJob, ReleaseStage, TriggerEvent, TriggerKind, WorkflowRun,
    };
    pub use crate::correlator::{Correlator, NormalizedReport, ReportSink, ResultPattern};
    pub use crate::errors::{ErrorClass, OrchestratorError, PipelineError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::orchestrator::{HandleOutcome, Orchestrator, OrchestratorBuilder};
    pub use crate::pipeline::{BuildStep, ReleasePipeline, RetryConfig};
    pub use crate::publish::{PublishTarget, Publisher};
    pub use crate::store::{FileJobStore, InMemoryJobStore, JobStore};
}
