//! Tracing setup and span helpers.

use tracing::Span;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::core::{TriggerEvent, TriggerKind};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.filter` when set. Returns false if a
/// subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match config.format {
        LogFormat::Pretty => builder.compact().try_init().is_ok(),
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .try_init()
            .is_ok(),
    }
}

/// A span covering the handling of one delivery.
#[must_use]
pub fn event_span(event: &TriggerEvent) -> Span {
    match event.kind {
        TriggerKind::WorkflowCompleted => tracing::info_span!(
            "correlate",
            delivery_id = %event.delivery_id,
            commit = %event.source_commit,
            run_id = event.upstream_run_id,
        ),
        TriggerKind::TagPushed | TriggerKind::ReleasePublished => tracing::info_span!(
            "release",
            delivery_id = %event.delivery_id,
            kind = %event.kind,
            commit = %event.source_commit,
            version = event.version().as_deref().unwrap_or("-"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
    }

    #[test]
    fn test_event_span_builds_for_every_kind() {
        let tag = TriggerEvent::tag_pushed("v1.0.0", "abc");
        let _entered = event_span(&tag).entered();
        let run = crate::core::WorkflowRun {
            id: 1,
            conclusion: crate::core::Conclusion::Success,
            head_commit: "abc".to_string(),
            event_name: "push".to_string(),
        };
        let _ = event_span(&TriggerEvent::workflow_completed(&run));
    }
}
