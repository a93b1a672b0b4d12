use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Why the process is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl-C
    Interrupt,
    /// SIGTERM, usually from the orchestrator
    Terminate,
    /// Requested in-process
    Requested,
}

/// Turns OS signals into one cancellation that every long-lived task observes.
///
/// The HTTP server stops accepting and drains in-flight requests when the token fires;
/// the audit pipeline is drained after that, bounded by `drain_timeout`.
pub struct GracefulShutdown {
    token: CancellationToken,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// 30-second drain budget.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if !self.token.is_cancelled() {
            tracing::info!(?reason, "Shutdown triggered");
        }
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM, or for an in-process trigger, then cancel the token.
    pub async fn run_signal_handler(&self) -> ShutdownReason {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        let reason = tokio::select! {
            _ = wait_for_ctrl_c() => ShutdownReason::Interrupt,
            _ = wait_for_sigterm() => ShutdownReason::Terminate,
            _ = self.token.cancelled() => ShutdownReason::Requested,
        };
        tracing::info!(?reason, "Initiating graceful shutdown");
        self.token.cancel();
        reason
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // Only Ctrl-C exists here.
    std::future::pending::<()>().await;
}
