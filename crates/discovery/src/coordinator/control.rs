use crate::models::DiscoveryStatus;
use crate::pool::Signal;
use std::sync::Arc;
use tokio::sync::watch;

/// Handle for steering a running discovery from another task.
///
/// Requests are level-triggered: sending the same request twice is the same
/// as sending it once. Requests made while no run is in progress are
/// discarded when the next run starts.
#[derive(Debug, Clone)]
pub struct DiscoveryControl {
    pub(super) signal: Arc<watch::Sender<Signal>>,
    pub(super) status: watch::Receiver<DiscoveryStatus>,
}
impl DiscoveryControl {
    fn request(&self, signal: Signal) {
        self.signal.send_if_modified(|current| {
            let changed = *current != signal;
            *current = signal;
            changed
        });
    }

    /// Hold every unit at its next suspension point.
    pub fn pause(&self) {
        self.request(Signal::Pause);
    }

    pub fn resume(&self) {
        self.request(Signal::Run);
    }

    /// Cancel every outstanding unit. Counters are kept for a later resume.
    pub fn stop(&self) {
        self.request(Signal::Stop);
    }

    pub fn status(&self) -> DiscoveryStatus {
        *self.status.borrow()
    }

    /// Wait until the status satisfies `predicate`, returning that status.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&DiscoveryStatus) -> bool) -> DiscoveryStatus {
        let waited = self.status.wait_for(predicate).await.map(|status| *status).ok();
        // The coordinator is gone; its last status is final.
        waited.unwrap_or_else(|| *self.status.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> (watch::Sender<DiscoveryStatus>, DiscoveryControl) {
        let (status_tx, status) = watch::channel(DiscoveryStatus::Idle);
        let (signal, _) = watch::channel(Signal::Run);
        let control = DiscoveryControl {
            signal: Arc::new(signal),
            status,
        };
        (status_tx, control)
    }

    #[tokio::test]
    async fn test_wait_for_sees_later_transition() {
        let (status_tx, mut control) = control();
        let waiter = tokio::spawn(async move { control.wait_for(|s| *s == DiscoveryStatus::Paused).await });
        status_tx.send_replace(DiscoveryStatus::Running);
        status_tx.send_replace(DiscoveryStatus::Paused);
        assert_eq!(waiter.await.unwrap(), DiscoveryStatus::Paused);
    }

    #[tokio::test]
    async fn test_wait_for_returns_last_status_once_coordinator_is_gone() {
        let (status_tx, mut control) = control();
        status_tx.send_replace(DiscoveryStatus::Stopped);
        drop(status_tx);
        let status = control.wait_for(|s| *s == DiscoveryStatus::Completed).await;
        assert_eq!(status, DiscoveryStatus::Stopped);
        assert_eq!(control.status(), DiscoveryStatus::Stopped);
    }
}
