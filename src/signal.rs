//! One-shot latches coordinating the receive task with other paths
//!
//! A latch starts clear and can be tripped exactly once; tripping releases
//! every current and future waiter. The close path waits on the
//! receive-exit latch with a bounded timeout, keep-alive logic waits on
//! the pong latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// A one-shot latch
#[derive(Default)]
pub struct Latch {
    tripped: AtomicBool,
    notify: Notify,
}

impl Latch {
    /// Create a clear latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the latch, releasing all waiters. Idempotent.
    pub fn trip(&self) {
        self.tripped.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Check without waiting
    #[inline]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Wait until the latch trips or `timeout` elapses.
    /// Returns true when the latch tripped in time.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the flag check so a concurrent trip cannot
            // slip between them.
            notified.as_mut().enable();

            if self.is_tripped() {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.is_tripped();
            }
        }
    }
}
