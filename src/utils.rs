//utils for graceful shutdown when the host terminates the process
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Token cancelled on the first Ctrl-C.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let tc = token.clone();
    //spawn once to listen for ctrl-c
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => tc.cancel(),
            Err(e) => warn!(error = %e, "failed to install ctrl-c handler"),
        }
    });
    token
}
