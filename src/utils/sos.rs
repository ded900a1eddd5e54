//! Signal-of-Stop: cooperative cancellation for chunk senders and workers.
//!
//! Clones share one flag. Cancelling any clone wakes every waiter; a sender
//! that observes the flag stops before its next side effect.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    closing: AtomicBool,
    notify: Notify,
}

#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    inner: Arc<Shared>,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Calling it again is a no-op.
    pub fn cancel(&self) {
        if !self.inner.closing.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn cancelled(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is signaled (immediately if it already was).
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Race a future against cancellation. `None` means cancelled first.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.wait() => None,
            res = fut => Some(res),
        }
    }

    /// Sleep for `delay` unless cancelled. Returns `false` on cancellation.
    pub async fn sleep(&self, delay: Duration) -> bool {
        self.select(tokio::time::sleep(delay)).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_clones() {
        let sos = SignalOfStop::new();
        let other = sos.clone();
        let waiter = tokio::spawn(async move { other.wait().await });
        tokio::task::yield_now().await;
        sos.cancel();
        waiter.await.unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn wait_returns_when_already_cancelled() {
        let sos = SignalOfStop::new();
        sos.cancel();
        sos.cancel();
        sos.wait().await;
        assert_eq!(sos.select(async { 1 }).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_reports_completion_or_cancellation() {
        let sos = SignalOfStop::new();
        assert!(sos.sleep(Duration::from_millis(200)).await);

        let other = sos.clone();
        let sleeper = tokio::spawn(async move { other.sleep(Duration::from_secs(60)).await });
        tokio::task::yield_now().await;
        sos.cancel();
        assert!(!sleeper.await.unwrap());
    }
}
