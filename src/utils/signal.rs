//! Signal handling for graceful termination

use tracing::{info, warn};

/// Resolve once SIGINT or SIGTERM arrives. If the handlers cannot be
/// installed, falls back to Ctrl-C only.
pub async fn wait_for_shutdown() {
	use tokio::signal;

	let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
		Ok(stream) => stream,
		Err(e) => {
			warn!("Failed to setup SIGTERM handler: {}. Only Ctrl-C will stop combox.", e);
			if let Err(e) = signal::ctrl_c().await {
				warn!("Failed to wait for Ctrl-C: {}", e);
			}
			return;
		}
	};

	let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
		Ok(stream) => stream,
		Err(e) => {
			warn!("Failed to setup SIGINT handler: {}", e);
			sigterm.recv().await;
			return;
		}
	};

	tokio::select! {
		_ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
		_ = sigint.recv() => info!("Received SIGINT, shutting down"),
	}
}

// vim: ts=4
