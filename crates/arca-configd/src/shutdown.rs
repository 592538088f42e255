//! Graceful shutdown coordination (§5 shared resources, §9 "Shutdown").
//!
//! The storage handle and its connection pool are process-wide singletons;
//! background workers (currently only the single-node lock reaper) need a
//! way to be told to stop without the foreground path ever blocking on
//! them. A `broadcast` channel lets one coordinator signal an arbitrary
//! number of workers at once.

use std::time::Duration;

use tokio::sync::broadcast;

/// Sent on the shutdown channel to ask background workers to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Finish the current tick, then exit the loop.
    Graceful,
}

/// How long [`ShutdownCoordinator::shutdown`] waits for a worker to
/// acknowledge before giving up (§5: "waits up to 5 seconds before giving
/// up").
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Broadcasts [`ShutdownSignal`] to background workers and bounds how long
/// callers wait for them to finish.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    tx: broadcast::Sender<ShutdownSignal>,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(4);
        Self { tx }
    }

    /// Subscribe a new background worker to shutdown signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.tx.subscribe()
    }

    /// Broadcast [`ShutdownSignal::Graceful`] and wait for `handle` to
    /// finish, up to [`SHUTDOWN_GRACE_PERIOD`]. A handle that does not
    /// finish in time is abandoned, not aborted: the task keeps running
    /// detached, logged as a warning by the caller.
    pub async fn shutdown(&self, handle: tokio::task::JoinHandle<()>) -> bool {
        let _ = self.tx.send(ShutdownSignal::Graceful);
        tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, handle).await.is_ok()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_waits_for_worker_to_observe_signal() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        let handle = tokio::spawn(async move {
            let _ = rx.recv().await;
        });
        assert!(coordinator.shutdown(handle).await);
    }

    #[tokio::test]
    async fn shutdown_times_out_on_a_worker_that_never_stops() {
        let coordinator = ShutdownCoordinator::new();
        let _rx = coordinator.subscribe();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(!coordinator.shutdown(handle).await);
    }
}
