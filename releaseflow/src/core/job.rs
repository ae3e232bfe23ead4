//! The release job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::artifact::ReleaseArtifact;
use super::event::TriggerKind;
use super::status::{JobStatus, ReleaseStage};
use super::version::strip_tag_prefix;
use crate::errors::{ErrorClass, RecordedError};

/// Key identifying a release job: the normalized version string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    /// Creates a key from a version or tag, stripping a `v` prefix.
    #[must_use]
    pub fn new(version: &str) -> Self {
        Self(strip_tag_prefix(version.trim()).to_string())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One version's progress through the publish pipeline.
///
/// Jobs are only changed through the transition function, and only
/// persisted through a compare-and-swap on `(stage, revision)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseJob {
    /// The release version.
    pub version: String,
    /// The commit being released.
    pub commit: String,
    /// Current stage.
    pub stage: ReleaseStage,
    /// Publish attempts made in the current stage.
    pub attempts: u32,
    /// Last classified failure, if any.
    pub last_error: Option<RecordedError>,
    /// The stage the job was in when it failed.
    #[serde(default)]
    pub failed_from: Option<ReleaseStage>,
    /// Kind of the trigger that created this job.
    pub trigger: TriggerKind,
    /// Built artifact, once the job passed `Built`.
    #[serde(default)]
    pub artifact: Option<ReleaseArtifact>,
    /// Bumped on every stored write.
    pub revision: u64,
    /// When the job was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the job was last written.
    pub updated_at: DateTime<Utc>,
}

impl ReleaseJob {
    /// Creates a pending job.
    #[must_use]
    pub fn new(version: impl Into<String>, commit: impl Into<String>, trigger: TriggerKind) -> Self {
        let now = Utc::now();
        Self {
            version: version.into(),
            commit: commit.into(),
            stage: ReleaseStage::Pending,
            attempts: 0,
            last_error: None,
            failed_from: None,
            trigger,
            artifact: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The store key for this job.
    #[must_use]
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.version)
    }

    /// Externally visible status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        match self.stage {
            ReleaseStage::Promoted => JobStatus::Promoted,
            ReleaseStage::Failed => JobStatus::Failed {
                reason: self.last_error.clone().unwrap_or_else(|| {
                    RecordedError::new(ErrorClass::Internal, "failed without a recorded error")
                }),
            },
            stage => JobStatus::InProgress { stage },
        }
    }

    /// Converts to a dictionary representation for event payloads.
    #[must_use]
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "version": self.version,
            "commit": self.commit,
            "stage": self.stage,
            "attempts": self.attempts,
            "revision": self.revision,
            "trigger": self.trigger,
            "last_error": self.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_strips_prefix() {
        assert_eq!(JobKey::new("v1.2.3"), JobKey::new("1.2.3"));
        assert_eq!(JobKey::new(" 1.2.3 ").as_str(), "1.2.3");
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = ReleaseJob::new("1.2.3", "abc", TriggerKind::TagPushed);
        assert_eq!(job.stage, ReleaseStage::Pending);
        assert_eq!(job.revision, 0);
        assert_eq!(job.status(), JobStatus::InProgress { stage: ReleaseStage::Pending });
    }

    #[test]
    fn test_failed_status_carries_error() {
        let mut job = ReleaseJob::new("1.2.3", "abc", TriggerKind::ReleasePublished);
        job.stage = ReleaseStage::Failed;
        job.last_error = Some(RecordedError::new(ErrorClass::Auth, "401"));
        match job.status() {
            JobStatus::Failed { reason } => assert_eq!(reason.class, ErrorClass::Auth),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_job_serde_round_trip() {
        let job = ReleaseJob::new("1.2.3", "abc", TriggerKind::TagPushed);
        let json = serde_json::to_string(&job).unwrap();
        let back: ReleaseJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
