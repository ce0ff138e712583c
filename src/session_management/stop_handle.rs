use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cloneable stop request for a running capture.
///
/// Safe to trigger from any task or signal handler: it only raises a flag and wakes
/// the capture loop, which then drains the pool itself.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        while !self.is_requested() {
            self.wakeup.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_wakes_waiter() {
        let handle = StopHandle::new();
        let remote = handle.clone();
        assert!(!handle.is_requested());

        let waiter = tokio::spawn(async move { handle.stopped().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        remote.request_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(remote.is_requested());
    }

    #[tokio::test]
    async fn test_stop_before_wait() {
        let handle = StopHandle::new();
        handle.request_stop();
        tokio_test::assert_ready!(tokio_test::task::spawn(handle.stopped()).poll());
    }
}
