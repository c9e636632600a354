//! Cooperative cancellation for drain loops and fetch sequences.
//!
//! A [`Shutdown`] handle is shared across tasks; loops check it at iteration
//! boundaries and sleeps select against it so a pause or backoff wait ends
//! promptly. In-flight requests and handler calls are never aborted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Shared handle to a shutdown signal.
pub type SharedShutdown = Arc<Shutdown>;

/// One-way cancellation signal. Once requested it stays requested.
#[derive(Debug, Default)]
pub struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Create a new shared signal wrapped in [`Arc`].
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Request cancellation. Wakes all waiters exactly once.
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested. Returns immediately if already set.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before the flag check so a concurrent request() cannot
        // fire between the check and the await.
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

/// Sleep for `duration` unless cancellation arrives first.
///
/// Returns `true` if the full duration elapsed, `false` if interrupted.
pub async fn sleep_unless_cancelled(duration: Duration, shutdown: &Shutdown) -> bool {
    if shutdown.is_requested() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.wait() => false,
    }
}
