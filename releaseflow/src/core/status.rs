//! Release stage and job status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::RecordedError;

/// The stage a release job has reached.
///
/// Stages form a strict chain `Pending -> Built -> Verified ->
/// StagedPublished -> Promoted`. `Failed` can be entered from any
/// non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStage {
    /// Job is recorded but nothing has run.
    Pending,
    /// The artifact was built.
    Built,
    /// The artifact and version passed verification.
    Verified,
    /// The artifact is on the staging index.
    StagedPublished,
    /// The artifact is on the production index.
    Promoted,
    /// The job halted with an error.
    Failed,
}

impl Default for ReleaseStage {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for ReleaseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Built => write!(f, "built"),
            Self::Verified => write!(f, "verified"),
            Self::StagedPublished => write!(f, "staged_published"),
            Self::Promoted => write!(f, "promoted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl ReleaseStage {
    /// Position in the forward chain. `Failed` has no position.
    #[must_use]
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Built => Some(1),
            Self::Verified => Some(2),
            Self::StagedPublished => Some(3),
            Self::Promoted => Some(4),
            Self::Failed => None,
        }
    }

    /// The stage directly after this one, if any.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Built),
            Self::Built => Some(Self::Verified),
            Self::Verified => Some(Self::StagedPublished),
            Self::StagedPublished => Some(Self::Promoted),
            Self::Promoted | Self::Failed => None,
        }
    }

    /// Returns true for `Promoted` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Promoted | Self::Failed)
    }

    /// Returns true if this stage is at or past `other` in the chain.
    #[must_use]
    pub fn has_reached(&self, other: Self) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }
}

/// Externally visible completion status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// The release reached the production index.
    Promoted,
    /// The job halted; carries the last classified error.
    Failed {
        /// The recorded failure.
        reason: RecordedError,
    },
    /// The job exists and is not terminal.
    InProgress {
        /// The current stage.
        stage: ReleaseStage,
    },
    /// No job is known for the key.
    Unknown,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Promoted => write!(f, "promoted"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::InProgress { stage } => write!(f, "in progress ({stage})"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
