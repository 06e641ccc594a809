//! Operator signals: SIGUSR1 dumps engine diagnostics, SIGUSR2 logs statistics.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gateway::Gateway;

/// Listen for monitor signals until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
#[cfg(unix)]
pub fn spawn_monitor(
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut dump = signal(SignalKind::user_defined1())?;
    let mut stats = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = dump.recv() => {
                    info!("Received SIGUSR1, dumping diagnostics");
                    gateway.dump_diagnostics();
                }
                Some(()) = stats.recv() => {
                    info!("Received SIGUSR2, logging statistics");
                    gateway.log_stats();
                }
            }
        }
    }))
}

/// Monitor signals are unavailable on this platform.
#[cfg(not(unix))]
pub fn spawn_monitor(
    _gateway: Arc<Gateway>,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move { cancel.cancelled().await }))
}
