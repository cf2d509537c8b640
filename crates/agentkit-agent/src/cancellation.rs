//! Cooperative cancellation signal shared between the orchestrator and the
//! retry/fallback layer.
//!
//! Cancelling a handle does not preempt an opaque `run()` body already in
//! progress — that suspension point is user code the kernel does not
//! instrument. It is observed at the suspension points the kernel does own,
//! chiefly the retry backoff wait in `agentkit-fallback`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A one-shot, cloneable cancellation signal.
///
/// Cloning shares the same underlying flag: any clone can call `cancel()`
/// and every clone observes it via `is_cancelled()`/`cancelled()`.
#[derive(Clone)]
pub struct CancellationHandle {
    notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// A handle that has not been cancelled.
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal cancellation. Idempotent; wakes every task currently suspended
    /// in `cancelled()`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// `true` once `cancel()` has been called on this handle or a clone of it.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancelled — immediately if already cancelled, otherwise
    /// when a subsequent `cancel()` call arrives. Meant for use as one arm of
    /// `tokio::select!` alongside the suspension being raced.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_cancelled() {
        let handle = CancellationHandle::new();
        handle.cancel();
        assert!(handle.is_cancelled());
        handle.cancelled().await;
    }

    #[tokio::test]
    async fn cancelled_resolves_once_a_clone_calls_cancel() {
        let handle = CancellationHandle::new();
        let canceller = handle.clone();

        let waiter = tokio::spawn(async move {
            handle.cancelled().await;
        });

        tokio::task::yield_now().await;
        canceller.cancel();
        waiter.await.unwrap();
    }
}
