//! Graceful shutdown coordination.
//!
//! This module provides a [`ShutdownSignal`] shared by every task of a
//! [`WorkerPool`](crate::pool::WorkerPool). It fires once, either on SIGINT /
//! SIGTERM (see [`ShutdownSignal::wait`]) or programmatically through
//! [`ShutdownSignal::trigger`].
//!
//! Tasks poll [`ShutdownSignal::is_shutdown`] at the top of each iteration.
//! In-flight store calls are never interrupted; only pauses between
//! iterations ([`ShutdownSignal::sleep`]) end early.
//!
//! # Example
//!
//! ```rust,ignore
//! use streamgroup::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let worker_shutdown = shutdown.clone();
//!
//! tokio::spawn(async move {
//!     while !worker_shutdown.is_shutdown() {
//!         // ... one unit of work
//!         worker_shutdown.sleep(Duration::from_secs(1)).await;
//!     }
//! });
//!
//! shutdown.wait().await;
//! ```

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default time allowed for tasks to finish after shutdown, in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across tasks.
///
/// Clones share the same underlying token: triggering any clone is seen by
/// all of them.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    token: CancellationToken,
    /// Grace period for tasks to drain after the signal fires
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a new shutdown signal with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    /// Get the shutdown timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGTERM or SIGINT, then fire the signal.
    ///
    /// Returns early if the signal was already triggered.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                return;
            }
        }

        self.token.cancel();
    }

    /// Check if shutdown has been triggered. Never blocks.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown triggered programmatically");
        }
        self.token.cancel();
    }

    /// Resolve once shutdown has been triggered.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Sleep for `duration` unless shutdown fires first.
    ///
    /// Returns `true` if the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Wait for shutdown with a timeout.
    ///
    /// Returns `true` if shutdown fired within timeout, `false` if timed out.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => true,
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Timed out waiting for shutdown"
                );
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));
        assert!(!signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_custom_timeout() {
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(60));
        assert_eq!(signal.timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();

        // Trigger in a separate task
        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        // Should receive the signal
        let result = tokio::time::timeout(Duration::from_millis(500), signal.cancelled()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_clone_receives_signal() {
        let signal = ShutdownSignal::new();
        let signal2 = signal.clone();

        signal.trigger();

        assert!(signal.is_shutdown());
        assert!(signal2.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_ends_early_on_shutdown() {
        let signal = ShutdownSignal::new();
        assert!(signal.sleep(Duration::from_secs(1)).await);

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger_signal.trigger();
        });
        let started = tokio::time::Instant::now();
        assert!(!signal.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_with_timeout() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_with_timeout(Duration::from_secs(1)).await);
        signal.trigger();
        assert!(signal.wait_with_timeout(Duration::from_secs(1)).await);
    }
}
