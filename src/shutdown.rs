use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancels the returned token on the first SIGINT or SIGTERM.
///
/// Every blocking point of the server (accept loop, queue waits, sampling)
/// watches this token.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        info!("Cleaning up and terminating");
        trigger.cancel();
    });

    Ok(token)
}

/// Logs and swallows the error of a task that is not allowed to take the
/// server down.
pub fn log_failure<E: std::fmt::Display>(context: &str, outcome: Result<(), E>) {
    if let Err(err) = outcome {
        error!("{}: {}", context, err);
    }
}
