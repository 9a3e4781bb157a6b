//! Specializes [`Resolver`] for implementations that do periodic async
//! resolution work (DNS lookups, polling a control plane, ...), handling the
//! single-flight/backoff/retry machinery common to all of them so concrete
//! resolvers only need to implement [`Poll`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tonic::async_trait;
use tracing::{debug, warn};

use crate::backoff::BackoffBuilder;
use crate::cancel::CancelToken;
use crate::status::Status;

use super::{Resolver, ResolverListener, ResolverResult};

/// One resolution attempt. Implementations call `listener` directly with
/// whatever `ResolverResult`s they produce, and report via the return value
/// whether the attempt should be considered successful.
#[async_trait]
pub trait Poll: Send + Sync {
    /// Performs one resolution attempt, delivering any results to
    /// `listener`. Returns `Ok(true)` if an `OK` (`Success`) result was
    /// delivered, `Ok(false)` if the attempt completed without delivering
    /// one (treated as a failure by the polling helper), or `Err` if the
    /// attempt itself failed outright (also treated as a failure, after the
    /// polling helper turns it into a `Failure` result for the listener).
    ///
    /// `cancel` fires when the resolver is disposed; implementations doing
    /// cancellable work (a DNS lookup, a rate-limit sleep) should race
    /// against it rather than ignore it.
    async fn poll(&self, listener: &ResolverListener, cancel: &CancelToken) -> Result<bool, Status>;
}

struct Inner<P> {
    poller: Arc<P>,
    backoff_builder: BackoffBuilder,
    started: AtomicBool,
    cancel: CancelToken,
    refresh_signal: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
    log_target: &'static str,
}

/// The polling helper described by the framework: at most one resolve
/// attempt in flight at a time, concurrent `refresh()` calls coalesce onto
/// it, and failures (including attempts that complete without an `OK`
/// result) are retried with exponential backoff until cancellation.
pub struct PollingResolver<P: Poll + 'static> {
    inner: Arc<Inner<P>>,
}

impl<P: Poll + 'static> Clone for PollingResolver<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Poll + 'static> PollingResolver<P> {
    pub fn new(poller: P, backoff_builder: BackoffBuilder, log_target: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                poller: Arc::new(poller),
                backoff_builder,
                started: AtomicBool::new(false),
                cancel: CancelToken::new(),
                refresh_signal: Notify::new(),
                task: Mutex::new(None),
                log_target,
            }),
        }
    }

    fn run(&self, listener: ResolverListener) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = inner.backoff_builder.create();
            loop {
                if inner.cancel.is_cancelled() {
                    return;
                }
                let outcome = inner.poller.poll(&listener, &inner.cancel).await;
                if inner.cancel.is_cancelled() {
                    return;
                }
                match outcome {
                    Ok(true) => {
                        backoff = inner.backoff_builder.create();
                        // Wait for the next explicit refresh request (or
                        // cancellation). A concrete resolver with its own
                        // periodic cadence (e.g. DNS) triggers that via its
                        // own timer calling `refresh()`.
                        tokio::select! {
                            _ = inner.refresh_signal.notified() => {}
                            _ = inner.cancel.cancelled() => return,
                        }
                    }
                    Ok(false) => {
                        debug!(target: inner.log_target, "ResolverRefreshError: attempt completed without a success result");
                        let delay = backoff.next();
                        if !inner.cancel.sleep(delay).await {
                            return;
                        }
                    }
                    Err(status) => {
                        warn!(target: inner.log_target, %status, "ResolverRefreshError");
                        listener(ResolverResult::failure(status));
                        let delay = backoff.next();
                        if !inner.cancel.sleep(delay).await {
                            return;
                        }
                    }
                }
            }
        });
        *self.inner.task.lock().unwrap() = Some(handle);
    }
}

impl<P: Poll + 'static> Resolver for PollingResolver<P> {
    fn start(&self, listener: ResolverListener) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            panic!("PollingResolver::start called twice");
        }
        debug!(target: self.inner.log_target, "starting polling resolver");
        self.run(listener);
    }

    fn refresh(&self) {
        assert!(
            self.inner.started.load(Ordering::SeqCst),
            "PollingResolver::refresh called before start"
        );
        debug!(target: self.inner.log_target, "ResolverRefreshRequested");
        self.inner.refresh_signal.notify_one();
    }

    fn dispose(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingPoller {
        calls: Arc<AtomicUsize>,
        succeed_after: usize,
    }

    #[async_trait]
    impl Poll for CountingPoller {
        async fn poll(&self, listener: &ResolverListener, _cancel: &CancelToken) -> Result<bool, Status> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_after {
                listener(ResolverResult::success(vec![]));
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }

    #[tokio::test]
    async fn retries_on_failure_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let poller = CountingPoller {
            calls: calls.clone(),
            succeed_after: 3,
        };
        let resolver = PollingResolver::new(
            poller,
            BackoffBuilder::new()
                .base(Duration::from_millis(1))
                .max(Duration::from_millis(5)),
            "test",
        );
        let got_success = Arc::new(AtomicBool::new(false));
        let got_success2 = got_success.clone();
        resolver.start(Arc::new(move |r| {
            if matches!(r, ResolverResult::Success { .. }) {
                got_success2.store(true, Ordering::SeqCst);
            }
        }));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !got_success.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("should eventually succeed");
        assert!(calls.load(Ordering::SeqCst) >= 3);
        resolver.dispose();
    }

    #[tokio::test]
    #[should_panic(expected = "before start")]
    async fn refresh_before_start_panics() {
        let resolver = PollingResolver::new(
            CountingPoller {
                calls: Arc::new(AtomicUsize::new(0)),
                succeed_after: 1,
            },
            BackoffBuilder::new(),
            "test",
        );
        resolver.refresh();
    }
}
