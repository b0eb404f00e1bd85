use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

/// A wait-group whose wait is bounded. EC restore adds one count per
/// expected slice and waits with the configured send-file timeout.
pub struct TimeoutGroup {
    pending: AtomicI64,
    notify: Notify,
}

impl TimeoutGroup {
    pub fn new() -> Self {
        Self {
            pending: AtomicI64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn add(&self, n: i64) {
        self.pending.fetch_add(n, Ordering::SeqCst);
    }

    pub fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) - 1 <= 0 {
            self.notify.notify_waiters();
        }
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Returns true when the wait timed out with counts still outstanding.
    pub async fn wait_timeout(&self, dur: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            if self.pending.load(Ordering::SeqCst) <= 0 {
                return false;
            }
            let notified = self.notify.notified();
            if self.pending.load(Ordering::SeqCst) <= 0 {
                return false;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return true;
            }
            if timeout(remaining, notified).await.is_err() {
                return self.pending.load(Ordering::SeqCst) > 0;
            }
        }
    }
}

impl Default for TimeoutGroup {
    fn default() -> Self {
        Self::new()
    }
}
