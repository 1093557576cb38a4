//! Process-wide stop signal.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the process is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT, usually Ctrl-C at a terminal
    CtrlC,
    /// SIGTERM, as sent by the kubelet on pod deletion
    Sigterm,
    /// Some component finished on its own and stopped the rest
    Internal,
}

/// Owns the root cancellation token every task hangs off.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// A fresh, uncancelled stop signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that fires when the process stops.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops everything holding a token.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for SIGINT or SIGTERM, or for someone else to cancel, then
    /// cancels the token.
    pub async fn wait_for_signal(&self) -> ShutdownReason {
        let reason = tokio::select! {
            () = ctrl_c() => ShutdownReason::CtrlC,
            () = sigterm() => ShutdownReason::Sigterm,
            () = self.token.cancelled() => ShutdownReason::Internal,
        };
        info!(reason = ?reason, "shutting down");
        self.cancel();
        reason
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "unable to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "unable to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
