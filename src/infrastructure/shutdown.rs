//! Shutdown Signal
//!
//! Waits for the process to be asked to stop so the node can leave the ring
//! cleanly instead of being dropped by its neighbours' pings.

/// Completes on Ctrl+C or SIGTERM. A handler that cannot be installed is
/// logged and treated as never firing.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, leaving the ring");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, leaving the ring");
        }
    }
}
