//! Core domain model types for releaseflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Trigger events and upstream workflow runs
//! - Release jobs, stages and externally visible status
//! - Artifact descriptors
//! - Version parsing and placeholder detection

mod artifact;
mod event;
mod job;
mod status;
mod version;

pub use artifact::{sha256_hex, ArtifactBundle, ArtifactRef, LoadedArtifact, ReleaseArtifact};
pub use event::{Conclusion, TriggerEvent, TriggerKind, WorkflowRun};
pub use job::{JobKey, ReleaseJob};
pub use status::{JobStatus, ReleaseStage};
pub use version::{check_version_sanity, strip_tag_prefix, ReleaseVersion, PLACEHOLDER_VERSIONS};
