//! Graceful-shutdown wiring.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Returns a token that is cancelled when the process receives SIGINT or
/// SIGTERM.
#[cfg(unix)]
pub fn shutdown_token() -> Result<CancellationToken> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::debug;

    let mut interrupt = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let token = CancellationToken::new();
    let fired = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => debug!("Received SIGINT"),
            _ = terminate.recv() => debug!("Received SIGTERM"),
        }
        fired.cancel();
    });
    Ok(token)
}

/// Returns a token that is cancelled on ctrl-c.
#[cfg(not(unix))]
pub fn shutdown_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let fired = token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        fired.cancel();
    });
    Ok(token)
}
