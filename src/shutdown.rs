//! Signal handling for the CLI.
//!
//! A signal cancels the run token, which takes the same path as a client
//! disconnect: nodes stop, open rows are closed as `canceled`, and the run
//! returns once persistence has finished.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels a token on SIGINT/SIGTERM (Ctrl+C elsewhere).
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when a signal arrives.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn request_shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn the listener. It exits early if the token is cancelled some
    /// other way.
    pub fn listen(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.token.cancelled() => {}
                received = wait_for_signal() => {
                    if received {
                        shutdown.request_shutdown();
                    }
                }
            }
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> bool {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to create SIGTERM handler: {}", e);
            return signal::ctrl_c().await.is_ok();
        }
    };
    let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to create SIGINT handler: {}", e);
            return sigterm.recv().await.is_some();
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, cancelling run"),
        _ = sigint.recv() => info!("Received SIGINT, cancelling run"),
    }
    true
}

#[cfg(not(unix))]
async fn wait_for_signal() -> bool {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, cancelling run");
            true
        }
        Err(e) => {
            warn!("Failed to listen for Ctrl+C: {}", e);
            false
        }
    }
}
