// Shutdown token and stop-request signal

use crate::error::{AppError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Shutdown signal for graceful termination
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for shutdown signal (returns at once if already signalled)
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    /// Err(Cancelled) once shutdown was requested
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless shutdown comes first
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let mut token = self.clone();
        tokio::select! {
            _ = sleep(duration) => Ok(()),
            _ = token.wait() => Err(AppError::Cancelled),
        }
    }

    /// Drive `fut` to completion unless shutdown comes first
    pub async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output> {
        let mut token = self.clone();
        tokio::select! {
            out = fut => Ok(out),
            _ = token.wait() => Err(AppError::Cancelled),
        }
    }
}

/// Shutdown sender
pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Signal shutdown to all workers
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Create a shutdown channel
pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender { tx }, ShutdownToken { rx })
}

/// Notification that a service asked to be stopped.
///
/// Owners subscribe once at wiring time; the signal is re-armed each time
/// the service starts.
#[derive(Clone)]
pub struct StopRequested {
    rx: watch::Receiver<bool>,
}

impl StopRequested {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the service requests its stop
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            // Runtime dropped: it will never raise the signal
            std::future::pending::<()>().await;
        }
    }
}

/// Raising side of [`StopRequested`], owned by a runtime
#[derive(Clone)]
pub(crate) struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn raise(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn rearm(&self) {
        self.tx.send_replace(false);
    }

    pub(crate) fn subscribe(&self) -> StopRequested {
        StopRequested {
            rx: self.tx.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_after_shutdown() {
        let (tx, mut token) = shutdown_channel();
        assert!(!token.is_shutdown());
        tx.shutdown();
        token.wait().await;
        assert!(token.is_shutdown());
        assert!(matches!(token.ensure_running(), Err(AppError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_shutdown() {
        let (tx, token) = shutdown_channel();
        let handle = tokio::spawn(async move { token.sleep(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        tx.shutdown();
        assert!(matches!(handle.await.unwrap(), Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_stop_signal_rearms() {
        let signal = StopSignal::new();
        let mut requested = signal.subscribe();
        assert!(!requested.is_requested());

        signal.raise();
        requested.wait().await;
        assert!(requested.is_requested());

        signal.rearm();
        assert!(!requested.is_requested());
    }
}
