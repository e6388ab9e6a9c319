//! Request-scoped cancellation
//!
//! A [`CancelHandle`] is held by whoever owns the inbound request; every
//! fetch made on its behalf holds a [`CancelSignal`] and races it against the
//! backend call. Cancelling is idempotent and wakes all signals at once.

use tokio::sync::watch;

/// Owner side; cancels every signal derived from it
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observer side, cheap to clone into each fetch
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelHandle { tx }
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        // dropping the owner means the request is gone
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        CancelSignal { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once cancellation is requested; pends forever for `never()`
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        // a closed channel can only mean the handle was dropped after cancelling
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_all_signals() {
        let handle = CancelHandle::new();
        let a = handle.signal();
        let b = handle.signal();

        let waiters = tokio::spawn(async move {
            tokio::join!(a.cancelled(), b.cancelled());
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiters)
            .await
            .expect("signals should fire")
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_created_after_cancel() {
        let handle = CancelHandle::new();
        handle.cancel();
        let signal = handle.signal();
        assert!(signal.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already cancelled");
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        drop(handle);
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("drop should cancel");
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        let fired = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(fired.is_err());
    }
}
