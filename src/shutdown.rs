use std::sync::Arc;
use std::time::Duration;

use tokio::signal;

use crate::server::AppState;

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Give in-flight runs up to the configured grace period to finish.
/// Returns the number of runs still unfinished when the grace period ran out.
pub async fn graceful_shutdown(state: &Arc<AppState>) -> usize {
    tracing::info!("Starting graceful shutdown...");

    let in_flight = state.in_flight();
    if in_flight == 0 {
        tracing::info!("No in-flight runs to wait for");
        return 0;
    }

    let grace = Duration::from_secs(state.config.server.shutdown_grace_secs);
    tracing::info!(
        count = in_flight,
        grace_secs = grace.as_secs(),
        "Waiting for in-flight runs"
    );

    match tokio::time::timeout(grace, state.drained()).await {
        Ok(()) => {
            tracing::info!("Graceful shutdown complete");
            0
        }
        Err(_) => {
            let abandoned = state.in_flight();
            tracing::warn!(
                count = abandoned,
                "Grace period elapsed with runs still in flight"
            );
            abandoned
        }
    }
}
