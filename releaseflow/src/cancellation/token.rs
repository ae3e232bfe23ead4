//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent - only the first cancellation reason is kept.
/// Holders can poll [`is_cancelled`](Self::is_cancelled) or await
/// [`cancelled`](Self::cancelled).
#[derive(Default)]
pub struct CancellationToken {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<String>>,
    /// Wakes tasks awaiting cancellation.
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.reason.write() = Some(reason.into());
            self.notify.notify_waiters();
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_token_cancel_idempotent() {
        let token = CancellationToken::new();
        token.cancel("First reason");
        token.cancel("Second reason");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("First reason".to_string()));
    }

    #[test]
    fn test_cancelled_pending_until_cancel() {
        let token = CancellationToken::new();
        let mut waiter = tokio_test::task::spawn(token.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        token.cancel("superseded");
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel("release event arrived");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel("done");
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled");
    }
}
