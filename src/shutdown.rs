use tokio_util::sync::CancellationToken;

/// Cancel the returned token on the first SIGINT or SIGTERM. A second
/// signal cancels `force` as well, aborting jobs that are still running.
pub fn install_shutdown_handler(force: CancellationToken) -> CancellationToken {
    let token = CancellationToken::new();
    let graceful = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown requested; draining running jobs");
        graceful.cancel();

        wait_for_signal().await;
        tracing::warn!("second signal received; cancelling running jobs");
        force.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "failed to install signal handlers; falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigint.recv() => tracing::info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
