use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// Nodes and the demo driver select on this token to stop their loops.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler, using Ctrl-C only");
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received SIGINT, shutting down");
                    cancel.cancel();
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("Received SIGINT, shutting down"),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                    return;
                }
            },
        }

        cancel.cancel();
    });

    token
}
