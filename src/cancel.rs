//! A small, cloneable cancellation signal.
//!
//! Unlike [`tokio::sync::Notify`] alone, [`CancelToken`] remembers that it
//! fired, so a task that checks `is_cancelled()` after the fact (rather than
//! racing to observe the notification) still sees it. This backs every
//! cancellable suspension point in the crate: resolver refreshes, the DNS
//! rate-limit sleep, subchannel connect attempts, and the pick loop's wait
//! for a new picker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancelToken(Arc<Inner>);

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once this token is cancelled. Safe to call repeatedly and
    /// from multiple tasks; never misses a cancellation that happened before
    /// the call, unlike a bare `Notify::notified().await`.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.0.notify.notified();
            // Re-check after subscribing to avoid a lost wakeup between the
            // check above and registering interest.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration` unless cancelled first. Returns `true` if the
    /// sleep completed, `false` if it was interrupted by cancellation.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_before_wait_is_still_observed() {
        let token = CancelToken::new();
        token.cancel();
        // Must not hang: cancellation happened before we started waiting.
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should resolve immediately");
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_cancel() {
        let token = CancelToken::new();
        let t2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            t2.cancel();
        });
        let completed = token.sleep(Duration::from_secs(10)).await;
        assert!(!completed);
    }

    #[tokio::test]
    async fn sleep_completes_without_cancel() {
        let token = CancelToken::new();
        let completed = token.sleep(Duration::from_millis(5)).await;
        assert!(completed);
    }
}
