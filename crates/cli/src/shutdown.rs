use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on the first SIGTERM or SIGINT.
pub fn install_shutdown_handler() -> anyhow::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, finishing in-flight jobs"),
            _ = sigint.recv() => tracing::info!("received SIGINT, finishing in-flight jobs"),
        }
        trigger.cancel();
    });

    Ok(token)
}
