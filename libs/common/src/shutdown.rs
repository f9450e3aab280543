//! Graceful shutdown utilities
//!
//! Provides unified shutdown signal handling for the service loops.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
///
/// On Windows only Ctrl+C is observed.
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(
                    "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
            },
            _ = async {
                match term_signal {
                    Some(mut sig) => {
                        sig.recv().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            } => {
                info!("Received terminate signal");
            },
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C signal");
    }
}

/// Create a cancellation token that is cancelled on the first shutdown signal
///
/// Every background loop gets a clone of the returned token and exits on
/// `cancelled()`.
///
/// ```ignore
/// let token = common::shutdown_token();
/// tokio::spawn(scheduler.run(token.clone()));
/// token.cancelled().await;
/// ```
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_shutdown() => {
                trigger.cancel();
            },
            () = trigger.cancelled() => {},
        }
    });

    token
}
