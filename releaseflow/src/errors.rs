//! Error types for the releaseflow orchestrator.
//!
//! Every component returns its own typed error. Each error reports an
//! [`ErrorClass`], and the orchestrator decides between retry and abort from
//! that class alone; leaf components never retry on their own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::core::ReleaseStage;

/// Classification of a failure, used to pick a retry or abort policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or timeout failure; retried with backoff up to a bound.
    Transient,
    /// The build step failed; the job is aborted.
    Build,
    /// Credentials were rejected; the job is aborted and an alert raised.
    Auth,
    /// Input failed validation (e.g. a placeholder version).
    Validation,
    /// A concurrent writer won a compare-and-swap race.
    Conflict,
    /// Anything else: I/O, serialization, rejected uploads.
    Internal,
}

impl ErrorClass {
    /// Returns true if the caller may retry the failed operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if this failure should page an operator.
    #[must_use]
    pub fn needs_alert(&self) -> bool {
        matches!(self, Self::Auth)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Build => write!(f, "build"),
            Self::Auth => write!(f, "auth"),
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// A classified error as recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    /// The error classification.
    pub class: ErrorClass,
    /// The rendered error message.
    pub message: String,
}

impl RecordedError {
    /// Creates a recorded error.
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("class".to_string(), serde_json::json!(self.class));
        map.insert("message".to_string(), serde_json::json!(self.message));
        map
    }
}

impl fmt::Display for RecordedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

/// Errors from the artifact store client.
#[derive(Debug, Clone, Error)]
pub enum ArtifactStoreError {
    /// The store could not be reached or timed out.
    #[error("Artifact store unreachable: {0}")]
    Unreachable(String),

    /// The store rejected our credentials.
    #[error("Artifact store rejected credentials: {0}")]
    Unauthorized(String),

    /// The run or artifact does not exist.
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// The store answered with something we could not interpret.
    #[error("Malformed artifact store response: {0}")]
    Malformed(String),
}

impl ArtifactStoreError {
    /// Returns the error classification.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unreachable(_) => ErrorClass::Transient,
            Self::Unauthorized(_) => ErrorClass::Auth,
            Self::NotFound(_) | Self::Malformed(_) => ErrorClass::Internal,
        }
    }
}

/// Errors from test-result correlation.
#[derive(Debug, Error)]
pub enum CorrelationError {
    /// The trigger did not carry a usable workflow run.
    #[error("Event has no resolvable workflow run: {0}")]
    MissingRun(String),

    /// Listing the run's artifacts failed after retries.
    #[error("Artifacts unavailable for run {run_id}: {source}")]
    ArtifactsUnavailable {
        /// The upstream run.
        run_id: u64,
        /// The last listing failure.
        #[source]
        source: ArtifactStoreError,
    },

    /// Downloading a matched bundle failed.
    #[error("Failed to download bundle '{bundle}': {source}")]
    Download {
        /// The bundle name.
        bundle: String,
        /// The underlying failure.
        #[source]
        source: ArtifactStoreError,
    },

    /// Unpacking a bundle into the scratch area failed.
    #[error("Failed to unpack bundle '{bundle}': {source}")]
    Unpack {
        /// The bundle name.
        bundle: String,
        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },
}

impl CorrelationError {
    /// Returns the error classification.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingRun(_) => ErrorClass::Validation,
            Self::ArtifactsUnavailable { source, .. } | Self::Download { source, .. } => {
                source.class()
            }
            Self::Unpack { .. } => ErrorClass::Internal,
        }
    }
}

/// Error raised by a reporting surface.
///
/// Report delivery is best-effort; this error is logged, never propagated
/// into job state.
#[derive(Debug, Clone, Error)]
#[error("Report delivery to {surface} failed: {message}")]
pub struct ReportError {
    /// The reporting surface.
    pub surface: String,
    /// What went wrong.
    pub message: String,
}

impl ReportError {
    /// Creates a new report error.
    #[must_use]
    pub fn new(surface: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            surface: surface.into(),
            message: message.into(),
        }
    }
}

/// Errors from a single publish call.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// Credentials were rejected by the index.
    #[error("Index rejected credentials for {target}: {message}")]
    Auth {
        /// The target index name.
        target: String,
        /// The server message.
        message: String,
    },

    /// Network failure or timeout; the caller may retry.
    #[error("Transient network error publishing to {target}: {message}")]
    TransientNetwork {
        /// The target index name.
        target: String,
        /// The failure message.
        message: String,
    },

    /// The index refused the upload for a non-transient reason.
    #[error("Index rejected upload to {target} (status {status}): {message}")]
    Rejected {
        /// The target index name.
        target: String,
        /// The HTTP status code.
        status: u16,
        /// The server message.
        message: String,
    },
}

impl PublishError {
    /// Returns the error classification.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Auth { .. } => ErrorClass::Auth,
            Self::TransientNetwork { .. } => ErrorClass::Transient,
            Self::Rejected { .. } => ErrorClass::Internal,
        }
    }
}

/// Error raised when a build step fails.
#[derive(Debug, Clone, Error)]
#[error("Build failed for {version}: {message}")]
pub struct BuildError {
    /// The version being built.
    pub version: String,
    /// What went wrong.
    pub message: String,
    /// Process exit code, when the build ran a process.
    pub exit_code: Option<i32>,
}

impl BuildError {
    /// Creates a new build error.
    #[must_use]
    pub fn new(version: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            message: message.into(),
            exit_code: None,
        }
    }

    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

/// Error raised when artifact or version verification fails.
#[derive(Debug, Clone, Error)]
#[error("Verification failed: {message}")]
pub struct VerificationError {
    /// What failed verification.
    pub message: String,
    /// The individual checks that failed.
    pub failed_checks: Vec<String>,
}

impl VerificationError {
    /// Creates a new verification error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failed_checks: Vec::new(),
        }
    }

    /// Sets the failed checks.
    #[must_use]
    pub fn with_checks(mut self, checks: Vec<String>) -> Self {
        self.failed_checks = checks;
        self
    }
}

/// Error raised when a state transition is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal transition for {version}: {from} -> {to}")]
pub struct TransitionError {
    /// The job version.
    pub version: String,
    /// The current stage.
    pub from: ReleaseStage,
    /// The requested stage.
    pub to: ReleaseStage,
}

/// Errors from the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored job changed since it was read.
    #[error("Stale write for {key}: expected {expected_stage}@{expected_revision}, found {actual_stage}@{actual_revision}")]
    Conflict {
        /// The job key.
        key: String,
        /// The stage the writer read.
        expected_stage: ReleaseStage,
        /// The revision the writer read.
        expected_revision: u64,
        /// The stage currently stored.
        actual_stage: ReleaseStage,
        /// The revision currently stored.
        actual_revision: u64,
    },

    /// No job exists for the key.
    #[error("No job stored for {0}")]
    Missing(String),

    /// Persisting the store failed.
    #[error("Job store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted snapshot could not be (de)serialized.
    #[error("Job store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns the error classification.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::Missing(_) | Self::Io(_) | Self::Serialization(_) => ErrorClass::Internal,
        }
    }
}

/// Errors surfaced by the release pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The build step failed.
    #[error("{0}")]
    Build(#[from] BuildError),

    /// Artifact or version verification failed.
    #[error("{0}")]
    Verification(#[from] VerificationError),

    /// A publish call failed.
    #[error("{0}")]
    Publish(#[from] PublishError),

    /// The transition function refused the move.
    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// The job store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A newer event took over the job.
    #[error("Superseded: {0}")]
    Superseded(String),
}

impl PipelineError {
    /// Returns the error classification.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Build(_) => ErrorClass::Build,
            Self::Verification(_) => ErrorClass::Validation,
            Self::Publish(e) => e.class(),
            Self::Transition(_) => ErrorClass::Validation,
            Self::Store(e) => e.class(),
            Self::Superseded(_) => ErrorClass::Conflict,
        }
    }

    /// Converts into the form recorded on a failed job.
    #[must_use]
    pub fn to_recorded(&self) -> RecordedError {
        RecordedError::new(self.class(), self.to_string())
    }
}

/// Errors returned by the orchestrator to its callers.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The event payload is unusable.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Correlation failed.
    #[error("{0}")]
    Correlation(#[from] CorrelationError),

    /// The release pipeline failed.
    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    /// The job store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A re-drive was requested for a job that is not halted.
    #[error("Job {version} cannot be re-driven from stage {stage}")]
    NotRedrivable {
        /// The job version.
        version: String,
        /// The job's current stage.
        stage: ReleaseStage,
    },
}

impl OrchestratorError {
    /// Returns the error classification.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidEvent(_) | Self::NotRedrivable { .. } => ErrorClass::Validation,
            Self::Correlation(e) => e.class(),
            Self::Pipeline(e) => e.class(),
            Self::Store(e) => e.class(),
        }
    }
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// The config path.
        path: String,
        /// The I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for our schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid config value for {field}: {message}")]
    Invalid {
        /// The offending field.
        field: String,
        /// Why it is invalid.
        message: String,
    },
}
