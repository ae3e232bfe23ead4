//! Trigger events and the upstream workflow runs they reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::version::strip_tag_prefix;

/// What kind of external occurrence produced a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// An upstream CI workflow run finished.
    WorkflowCompleted,
    /// A release tag was pushed.
    TagPushed,
    /// A release was published.
    ReleasePublished,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowCompleted => write!(f, "workflow_completed"),
            Self::TagPushed => write!(f, "tag_pushed"),
            Self::ReleasePublished => write!(f, "release_published"),
        }
    }
}

impl TriggerKind {
    /// Returns true for the kinds that drive the release pipeline.
    #[must_use]
    pub fn is_release(&self) -> bool {
        matches!(self, Self::TagPushed | Self::ReleasePublished)
    }
}

/// Conclusion of a finished workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    /// All jobs passed.
    Success,
    /// At least one job failed.
    Failure,
    /// The run was skipped and produced nothing.
    Skipped,
    /// The run was cancelled.
    Cancelled,
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An upstream workflow run, as described by the trigger payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run identifier in the artifact store.
    pub id: u64,
    /// How the run finished.
    pub conclusion: Conclusion,
    /// Commit the run tested.
    #[serde(alias = "head_sha")]
    pub head_commit: String,
    /// Event that started the run (`push`, `pull_request`, ...).
    #[serde(alias = "event")]
    pub event_name: String,
}

/// An inbound trigger delivery.
///
/// Deliveries are immutable once received. The same logical event may be
/// delivered more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Unique id of this delivery.
    #[serde(default = "Uuid::new_v4")]
    pub delivery_id: Uuid,
    /// What happened.
    pub kind: TriggerKind,
    /// The commit the event is about.
    pub source_commit: String,
    /// Raw event payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Upstream run id, when the ingress resolved one.
    #[serde(default)]
    pub upstream_run_id: Option<u64>,
    /// When the delivery was received.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// Creates a new event with an empty payload.
    #[must_use]
    pub fn new(kind: TriggerKind, source_commit: impl Into<String>) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            kind,
            source_commit: source_commit.into(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
            upstream_run_id: None,
            received_at: Utc::now(),
        }
    }

    /// Creates a tag-push event for `tag`.
    #[must_use]
    pub fn tag_pushed(tag: impl Into<String>, commit: impl Into<String>) -> Self {
        let tag: String = tag.into();
        Self::new(TriggerKind::TagPushed, commit).with_payload_field("tag", tag)
    }

    /// Creates a release-published event for `tag`.
    #[must_use]
    pub fn release_published(tag: impl Into<String>, commit: impl Into<String>) -> Self {
        let tag: String = tag.into();
        Self::new(TriggerKind::ReleasePublished, commit).with_payload_field("tag", tag)
    }

    /// Creates a workflow-completed event describing `run`.
    #[must_use]
    pub fn workflow_completed(run: &WorkflowRun) -> Self {
        let mut event = Self::new(TriggerKind::WorkflowCompleted, run.head_commit.clone());
        event.upstream_run_id = Some(run.id);
        event.with_payload_field(
            "workflow_run",
            serde_json::to_value(run).unwrap_or(serde_json::Value::Null),
        )
    }

    /// Sets a top-level payload field.
    #[must_use]
    pub fn with_payload_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        if !self.payload.is_object() {
            self.payload = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(obj) = self.payload.as_object_mut() {
            obj.insert(key.into(), value.into());
        }
        self
    }

    /// The upstream workflow run described by the payload.
    ///
    /// `upstream_run_id` fills in the run id when the payload lacks one.
    #[must_use]
    pub fn workflow_run(&self) -> Option<WorkflowRun> {
        let mut raw = self.payload.get("workflow_run")?.clone();
        if let (Some(obj), Some(id)) = (raw.as_object_mut(), self.upstream_run_id) {
            obj.entry("id").or_insert_with(|| serde_json::json!(id));
        }
        serde_json::from_value(raw).ok()
    }

    /// The tag named by the payload, with any `refs/tags/` prefix removed.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.payload
            .get("tag")
            .or_else(|| self.payload.get("ref"))
            .and_then(serde_json::Value::as_str)
            .map(|t| t.strip_prefix("refs/tags/").unwrap_or(t))
    }

    /// The release version this event refers to.
    ///
    /// An explicit `version` payload field wins over the tag.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        if let Some(v) = self.payload.get("version").and_then(serde_json::Value::as_str) {
            return Some(v.trim().to_string());
        }
        self.tag().map(|t| strip_tag_prefix(t.trim()).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_run() -> WorkflowRun {
        WorkflowRun {
            id: 42,
            conclusion: Conclusion::Failure,
            head_commit: "abc123".to_string(),
            event_name: "pull_request".to_string(),
        }
    }

    #[test]
    fn test_tag_event_version() {
        let event = TriggerEvent::tag_pushed("v1.2.3", "abc123");
        assert_eq!(event.kind, TriggerKind::TagPushed);
        assert_eq!(event.tag(), Some("v1.2.3"));
        assert_eq!(event.version(), Some("1.2.3".to_string()));
    }

    #[test]
    fn test_ref_payload_and_version_override() {
        let event = TriggerEvent::new(TriggerKind::TagPushed, "abc")
            .with_payload_field("ref", "refs/tags/v2.0.0");
        assert_eq!(event.version(), Some("2.0.0".to_string()));

        let event = event.with_payload_field("version", "2.0.1");
        assert_eq!(event.version(), Some("2.0.1".to_string()));
    }

    #[test]
    fn test_workflow_run_round_trip_through_payload() {
        let run = sample_run();
        let event = TriggerEvent::workflow_completed(&run);
        assert_eq!(event.upstream_run_id, Some(42));
        assert_eq!(event.workflow_run(), Some(run));
    }

    #[test]
    fn test_workflow_run_accepts_platform_field_names() {
        let event: TriggerEvent = serde_json::from_value(serde_json::json!({
            "kind": "workflow_completed",
            "source_commit": "abc",
            "upstream_run_id": 9,
            "payload": {
                "workflow_run": {
                    "conclusion": "skipped",
                    "head_sha": "abc",
                    "event": "push"
                }
            }
        }))
        .unwrap();

        let run = event.workflow_run().unwrap();
        assert_eq!(run.id, 9);
        assert_eq!(run.conclusion, Conclusion::Skipped);
        assert_eq!(run.event_name, "push");
    }

    #[test]
    fn test_missing_run_is_none() {
        let event = TriggerEvent::new(TriggerKind::WorkflowCompleted, "abc");
        assert!(event.workflow_run().is_none());
    }
}
