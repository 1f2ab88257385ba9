use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs in a loop so we stay responsive to further signals after triggering
/// shutdown. The first SIGINT/SIGTERM/SIGQUIT cancels the token and lets the
/// process wind down gracefully; a repeat signal terminates immediately.
pub async fn signal_handler(token: CancellationToken) {
    let mut sigint = signal(SignalKind::interrupt()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();
    let mut sigquit = signal(SignalKind::quit()).unwrap();

    loop {
        let signal = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigquit.recv() => "SIGQUIT",
        };

        if !token.is_cancelled() {
            info!("Got signal {signal}. Shutting down gracefully.");
            token.cancel();
        } else {
            warn!("Got signal {signal} during shutdown. Terminating immediately.");
            std::process::exit(1);
        }
    }
}
