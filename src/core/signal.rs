//! Auto-reset wake signal used to park an idle engine.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// An auto-reset event.
///
/// `raise` latches the signal and wakes a waiter; `wait` returns once the
/// signal is latched and consumes it. `clear` drops a pending latch so a
/// later `wait` parks again.
#[derive(Debug, Default)]
pub struct WakeSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl WakeSignal {
    /// Create a cleared signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the signal and wake the waiter, if any.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Drop a pending latch.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    /// Whether the signal is currently latched.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Wait until the signal is raised, then clear it.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the latch so a raise in between is not missed.
            notified.as_mut().enable();

            if self.raised.swap(false, Ordering::AcqRel) {
                return;
            }

            notified.await;
        }
    }
}
