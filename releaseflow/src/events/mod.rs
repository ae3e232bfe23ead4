//! Lifecycle events for observability.
//!
//! The orchestrator and release pipeline report job and report lifecycle
//! changes through an [`EventSink`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A job was recorded for a new version.
    #[serde(rename = "job.created")]
    JobCreated,
    /// A job moved to a new stage.
    #[serde(rename = "job.stage_changed")]
    JobStageChanged,
    /// A job halted in `Failed`.
    #[serde(rename = "job.failed")]
    JobFailed,
    /// A failed publish will be retried.
    #[serde(rename = "job.retry_scheduled")]
    JobRetryScheduled,
    /// A newer event took over a job.
    #[serde(rename = "job.superseded")]
    JobSuperseded,
    /// A normalized report was delivered.
    #[serde(rename = "report.published")]
    ReportPublished,
    /// Correlation ended without a report.
    #[serde(rename = "report.skipped")]
    ReportSkipped,
}

impl EventKind {
    /// The dotted event type name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "job.created",
            Self::JobStageChanged => "job.stage_changed",
            Self::JobFailed => "job.failed",
            Self::JobRetryScheduled => "job.retry_scheduled",
            Self::JobSuperseded => "job.superseded",
            Self::ReportPublished => "report.published",
            Self::ReportSkipped => "report.skipped",
        }
    }

    /// Returns true for events describing a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::JobFailed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// What happened.
    pub kind: EventKind,
    /// Job key or run id the event is about.
    pub key: Option<String>,
    /// Event details.
    pub data: serde_json::Value,
    /// When the event was emitted.
    pub emitted_at: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Creates an event with no key and empty data.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            key: None,
            data: serde_json::Value::Object(serde_json::Map::new()),
            emitted_at: Utc::now(),
        }
    }

    /// Sets the subject key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the event data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
