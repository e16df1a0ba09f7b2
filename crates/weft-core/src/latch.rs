//! Fire-once latches.
//!
//! A [`Latch`] fires exactly once and stays fired. Firing is idempotent, any
//! number of tasks can await it, and clones observe the same state. Sessions
//! use one latch to signal handshake completion (`init`) and another as the
//! universal cancellation fence for their workers.

use std::sync::Arc;
use tokio::sync::watch;

/// A one-shot, multi-observer signal.
#[derive(Clone)]
pub struct Latch {
    inner: Arc<watch::Sender<bool>>,
}

impl Latch {
    /// Create an unfired latch.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { inner: Arc::new(tx) }
    }

    /// Fire the latch. Idempotent.
    pub fn fire(&self) {
        self.inner.send_replace(true);
    }

    /// Whether the latch has fired.
    #[must_use]
    pub fn fired(&self) -> bool {
        *self.inner.borrow()
    }

    /// Wait until the latch fires. Returns immediately if already fired.
    pub async fn wait(&self) {
        let mut rx = self.inner.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // The sender lives in `self`, so the channel cannot close while we
        // hold a reference; an unfired latch must keep the waiter pending.
        std::future::pending::<()>().await;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("fired", &self.fired()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fire_wakes_waiter() {
        let latch = Latch::new();
        let waiter = latch.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        latch.fire();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_fire_is_idempotent() {
        let latch = Latch::new();
        latch.fire();
        latch.fire();
        assert!(latch.fired());
        latch.wait().await;
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let latch = Latch::new();
        let other = latch.clone();
        latch.fire();
        assert!(other.fired());
        other.wait().await;
    }
}
