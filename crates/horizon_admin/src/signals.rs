//! Shutdown signal handling.

use tokio::signal;
use tracing::info;

/// Waits for a termination signal so the service can drain the worker.
///
/// # Platform Support
///
/// * **Unix platforms**: SIGINT and SIGTERM
/// * **Windows**: Ctrl+C
///
/// # Returns
///
/// `Ok(())` once a signal arrives, or an error if the handlers could not be
/// installed.
///
/// # Example
///
/// ```rust,ignore
/// use crate::signals::wait_for_shutdown;
///
/// async fn serve(worker: Worker) -> Result<(), Box<dyn std::error::Error>> {
///     wait_for_shutdown().await?;
///     worker.shutdown().await;
///     Ok(())
/// }
/// ```
pub async fn wait_for_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
