//! Graceful shutdown coordinator
//!
//! Owns the root cancellation token. CAS calls and watch loops receive child
//! tokens, so a single `shutdown()` aborts every in-flight store call.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Graceful shutdown coordinator
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    root: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on shutdown; cancelling it does not affect the root
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Initiate shutdown
    pub fn shutdown(&self) {
        if self.root.is_cancelled() {
            warn!("Shutdown already in progress");
            return;
        }
        info!("Initiating graceful shutdown");
        self.root.cancel();
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&self) {
        self.root.cancelled().await
    }

    /// Run a component until it finishes or shutdown is requested
    ///
    /// Returns `None` if the component was interrupted.
    pub async fn run<F>(&self, component: &str, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        info!(component, "Starting component");

        let output = tokio::select! {
            biased;
            _ = self.root.cancelled() => {
                info!(component, "Component received shutdown signal");
                None
            }
            output = fut => {
                info!(component, "Component completed normally");
                Some(output)
            }
        };

        info!(component, "Component shutdown complete");
        output
    }
}

/// Install signal handlers for graceful shutdown
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        coordinator.shutdown();
    });
}

/// Install signal handlers for graceful shutdown (Windows)
#[cfg(windows)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        info!("Received Ctrl+C");
        coordinator.shutdown();
    });
}
