use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Countdown latch with a bounded wait.
///
/// Starts at `count`; every [`count_down`](Self::count_down) removes one, and
/// [`wait`](Self::wait) returns once the count is zero or the timeout elapses.
#[derive(Debug)]
pub struct CompletionGate {
    remaining: AtomicUsize,
    zero: Notify,
}

impl CompletionGate {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            zero: Notify::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Decrements the count, saturating at zero. Wakes all waiters when the
    /// count reaches zero.
    pub fn count_down(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if previous == Ok(1) {
            self.zero.notify_waiters();
        }
    }

    /// Returns `true` if the count reached zero before `timeout`.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_zero())
            .await
            .is_ok()
    }

    async fn wait_for_zero(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent final count_down is not missed.
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }

            notified.await;
        }
    }
}
