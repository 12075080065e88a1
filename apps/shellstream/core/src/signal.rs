use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-way "this end is closed" flag that tasks can await.
///
/// Used to close the read side of a channel or a pipe from a task other than
/// the one blocked on it.
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the signal closed and wakes every waiter. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`CloseSignal::close`] has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test_timeout::tokio_timeout_test]
    async fn waiters_wake_on_close() {
        let signal = Arc::new(CloseSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.closed().await })
        };
        tokio::task::yield_now().await;
        signal.close();
        waiter.await.expect("waiter joined");
        assert!(signal.is_closed());
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_resolves_immediately_after_close() {
        let signal = CloseSignal::new();
        signal.close();
        signal.close();
        signal.closed().await;
    }
}
