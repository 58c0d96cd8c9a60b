use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Watch for SIGTERM/SIGINT and cancel the returned token when one arrives.
///
/// The host binary races the scheduler loop against this token; workers are
/// left to finish on their own (there is no mid-flight cancellation).
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            _ = sigint.recv() => tracing::info!("SIGINT received"),
        }
        trigger.cancel();
    });

    token
}
