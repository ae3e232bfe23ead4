//! The release job state machine.
//!
//! [`transition`] is the only way to compute a job's next value. It never
//! touches the store; callers persist its result with a compare-and-swap.

use chrono::Utc;
use std::fmt;

use crate::core::{ReleaseArtifact, ReleaseJob, ReleaseStage};
use crate::errors::{RecordedError, TransitionError};

/// A requested change to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// `Pending -> Built`, recording the artifact.
    Build(ReleaseArtifact),
    /// `Built -> Verified`.
    Verify,
    /// `Verified -> StagedPublished` after `attempts` uploads.
    Stage {
        /// Uploads made, including the successful one.
        attempts: u32,
    },
    /// `StagedPublished -> Promoted`.
    Promote,
    /// Any non-terminal stage `-> Failed`.
    Fail {
        /// The classified error.
        error: RecordedError,
        /// Attempts made in the failing stage.
        attempts: u32,
    },
    /// `Failed ->` the stage the job failed from.
    Redrive,
}

impl Step {
    /// The stage the job is in after this step.
    #[must_use]
    pub fn target(&self, job: &ReleaseJob) -> ReleaseStage {
        match self {
            Self::Build(_) => ReleaseStage::Built,
            Self::Verify => ReleaseStage::Verified,
            Self::Stage { .. } => ReleaseStage::StagedPublished,
            Self::Promote => ReleaseStage::Promoted,
            Self::Fail { .. } => ReleaseStage::Failed,
            Self::Redrive => job.failed_from.unwrap_or(ReleaseStage::Pending),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build(_) => write!(f, "build"),
            Self::Verify => write!(f, "verify"),
            Self::Stage { .. } => write!(f, "stage"),
            Self::Promote => write!(f, "promote"),
            Self::Fail { .. } => write!(f, "fail"),
            Self::Redrive => write!(f, "redrive"),
        }
    }
}

/// Computes the job that results from applying `step` to `job`.
///
/// Forward steps must move exactly one stage along the chain. `Fail` is
/// allowed from any non-terminal stage. Terminal stages are absorbing; the
/// only way out of `Failed` is `Redrive`. The revision is left untouched.
pub fn transition(job: &ReleaseJob, step: Step) -> Result<ReleaseJob, TransitionError> {
    let to = step.target(job);
    let illegal = || TransitionError {
        version: job.version.clone(),
        from: job.stage,
        to,
    };

    let mut next = job.clone();
    match step {
        Step::Fail { error, attempts } => {
            if job.stage.is_terminal() {
                return Err(illegal());
            }
            next.failed_from = Some(job.stage);
            next.last_error = Some(error);
            next.attempts = attempts;
        }
        Step::Redrive => {
            if job.stage != ReleaseStage::Failed {
                return Err(illegal());
            }
            next.failed_from = None;
            next.attempts = 0;
        }
        forward => {
            if job.stage.next() != Some(to) {
                return Err(illegal());
            }
            next.last_error = None;
            next.attempts = match forward {
                Step::Build(artifact) => {
                    next.artifact = Some(artifact);
                    0
                }
                Step::Stage { attempts } => attempts,
                Step::Promote => 1,
                _ => 0,
            };
        }
    }

    next.stage = to;
    next.updated_at = Utc::now();
    Ok(next)
}
