use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::pipeline::Pipeline;

/// Listen for SIGTERM and SIGINT and wind the runner down.
///
/// The returned token is cancelled once either signal arrives and every job
/// has been cancelled and has sent its summary and ping.
pub fn install_shutdown_handler(pipeline: Arc<Pipeline>) -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down");
            }
        }

        pipeline.shutdown().await;
        token_clone.cancel();
    });

    Ok(token)
}
