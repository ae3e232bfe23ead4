//! Event sink trait and implementations.

use async_trait::async_trait;
use tracing::{debug, info, warn, Level};

use super::LifecycleEvent;

/// Receives lifecycle events for observability.
///
/// Sinks must never fail the caller; delivery problems are logged and
/// swallowed.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: LifecycleEvent);

    /// Emits an event without awaiting.
    fn try_emit(&self, event: LifecycleEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: LifecycleEvent) {}

    fn try_emit(&self, _event: LifecycleEvent) {}
}

/// A sink that writes events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &LifecycleEvent) {
        let key = event.key.as_deref().unwrap_or("-");
        if event.kind.is_failure() {
            warn!(event_type = %event.kind, key = %key, event_data = %event.data, "Event: {}", event.kind);
            return;
        }
        if self.level == Level::DEBUG {
            debug!(event_type = %event.kind, key = %key, event_data = %event.data, "Event: {}", event.kind);
        } else {
            info!(event_type = %event.kind, key = %key, event_data = %event.data, "Event: {}", event.kind);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: LifecycleEvent) {
        self.log_event(&event);
    }
}

/// A sink that keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<LifecycleEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Event type names in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.kind.to_string()).collect()
    }

    /// Events whose type name starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<LifecycleEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind.as_str().starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: LifecycleEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        NoOpEventSink.emit(LifecycleEvent::new(EventKind::JobCreated)).await;
        let sink = LoggingEventSink::default();
        sink.emit(LifecycleEvent::new(EventKind::JobFailed).with_key("1.0.0")).await;
        LoggingEventSink::debug().try_emit(LifecycleEvent::new(EventKind::ReportSkipped));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(LifecycleEvent::new(EventKind::JobCreated).with_key("1.0.0")).await;
        sink.try_emit(LifecycleEvent::new(EventKind::JobStageChanged));
        sink.try_emit(LifecycleEvent::new(EventKind::ReportPublished));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.kinds(), vec!["job.created", "job.stage_changed", "report.published"]);
        assert_eq!(sink.events_of_type("job.").len(), 2);
        assert_eq!(sink.events()[0].key.as_deref(), Some("1.0.0"));

        sink.clear();
        assert!(sink.is_empty());
    }
}
