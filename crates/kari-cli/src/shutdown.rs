//! Signal handling for graceful shutdown.

use tracing::{info, warn};

/// Wait for Ctrl+C or SIGTERM.
///
/// A handler that cannot be installed never fires, so the other one still
/// ends the wait.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(category = "core", error = %e, "Failed to install Ctrl+C handler");
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
                warn!(category = "core", error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!(category = "core", "Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!(category = "core", "Received SIGTERM, starting graceful shutdown");
        }
    }
}
