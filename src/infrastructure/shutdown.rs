//! Stop Signal
//!
//! One `ShutdownController` per agent. Its background loops and direct
//! channel tasks subscribe to it; `stop` fires it and then waits for the
//! open direct channels to wind down.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Stop flag, stop broadcast and a count of direct channels still doing I/O.
#[derive(Clone)]
pub struct ShutdownController {
    stopping: Arc<AtomicBool>,
    open_channels: Arc<AtomicUsize>,
    stop_tx: broadcast::Sender<()>,
    /// Woken when the last channel guard goes away
    drained: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            stopping: Arc::new(AtomicBool::new(false)),
            open_channels: Arc::new(AtomicUsize::new(0)),
            stop_tx,
            drained: Arc::new(Notify::new()),
        }
    }

    /// Receiver that fires once the controller is stopped.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.stop_tx.subscribe()
    }

    /// Stop everything subscribed. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping session tasks ({} direct channels open)", self.open_channels());
        let _ = self.stop_tx.send(());
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.open_channels.load(Ordering::SeqCst)
    }

    /// Wait until every direct channel task has dropped its guard.
    /// Returns false if `timeout` ran out first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                if self.open_channels() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!("{} direct channels still open after {:?}", self.open_channels(), timeout);
                false
            }
        }
    }

    /// Count a direct channel task as open until the guard is dropped.
    pub fn channel_guard(&self) -> ChannelGuard {
        self.open_channels.fetch_add(1, Ordering::SeqCst);
        ChannelGuard {
            controller: self.clone(),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a direct channel task for as long as it runs.
pub struct ChannelGuard {
    controller: ShutdownController,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if self.controller.open_channels.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.controller.drained.notify_waiters();
        }
    }
}

/// Resolves on Ctrl+C (or SIGTERM on unix) and stops `controller`.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal = tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    };
    tracing::info!("{} received", signal);
    controller.shutdown();
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_idempotent() {
        let controller = ShutdownController::new();
        let mut stop = controller.subscribe();
        assert!(!controller.is_shutdown());

        controller.shutdown();
        controller.shutdown();

        assert!(controller.is_shutdown());
        assert!(stop.try_recv().is_ok());
        assert!(stop.try_recv().is_err());
    }

    #[test]
    fn test_guards_count_open_channels() {
        let controller = ShutdownController::new();

        let reader = controller.channel_guard();
        let dialer = controller.clone().channel_guard();
        assert_eq!(controller.open_channels(), 2);

        drop(reader);
        assert_eq!(controller.open_channels(), 1);
        drop(dialer);
        assert_eq!(controller.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_drain_without_channels_is_immediate() {
        let controller = ShutdownController::new();
        controller.shutdown();
        assert!(controller.wait_for_drain(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_drain_waits_for_last_guard() {
        let controller = ShutdownController::new();
        let guard = controller.channel_guard();
        controller.shutdown();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(1)).await);
        assert_eq!(controller.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_timeout() {
        let controller = ShutdownController::new();
        let _guard = controller.channel_guard();
        controller.shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
    }
}
