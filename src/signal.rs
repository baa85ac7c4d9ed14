//! SIGINT/SIGTERM handling.
//!
//! Signals cancel a [`CancellationToken`] that every long-running
//! operation observes, so an interrupted apply stops between kernel
//! objects and running probes are killed.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spawn a listener that cancels `token` on the first SIGINT or SIGTERM.
///
/// If no handler can be registered (restricted environments), the token is
/// left alone and a warning is logged.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Failed to register SIGINT handler: {}", e);
                None
            }
        };
        let sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                None
            }
        };

        let name = match (sigint, sigterm) {
            (Some(mut int), Some(mut term)) => {
                tokio::select! {
                    _ = int.recv() => "SIGINT",
                    _ = term.recv() => "SIGTERM",
                    _ = token.cancelled() => return,
                }
            }
            (Some(mut int), None) => {
                tokio::select! {
                    _ = int.recv() => "SIGINT",
                    _ = token.cancelled() => return,
                }
            }
            (None, Some(mut term)) => {
                tokio::select! {
                    _ = term.recv() => "SIGTERM",
                    _ = token.cancelled() => return,
                }
            }
            (None, None) => {
                warn!("No signal handlers registered - graceful shutdown disabled");
                return;
            }
        };
        info!("Received {}, shutting down...", name);
        token.cancel();
    });
}
