//! Dock Sync probe - Binary Entry Point
//!
//! Connects to the configured realtime endpoint, logs every state change
//! and inbound message, and exits cleanly on Ctrl-C.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dock_sync::offline::{MutationExecutor, WriteFailure};
use dock_sync::{NetworkMonitor, SyncClient, SyncConfig, WebSocketTransport};

/// The probe only listens; any write stays queued
struct NoBackend;

impl MutationExecutor for NoBackend {
    fn execute<'a>(
        &'a self,
        _target: &'a str,
        _body: &'a [u8],
    ) -> BoxFuture<'a, Result<(), WriteFailure>> {
        Box::pin(async { Err(WriteFailure::Network("probe has no REST backend".to_string())) })
    }
}

#[tokio::main]
async fn main() -> dock_sync::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dock_sync=info")),
        )
        .init();

    let config = SyncConfig::from_env();
    let network = NetworkMonitor::new(true);
    let client = SyncClient::new(
        config,
        WebSocketTransport::new(),
        Arc::new(NoBackend),
        network.subscribe(),
    )?;

    client.subscribe(|message| {
        info!(kind = %message.kind, priority = ?message.priority, "message");
    });

    let shutdown = Arc::new(Notify::new());
    let notify = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || notify.notify_one()) {
        warn!(error = %e, "could not install Ctrl-C handler");
    }

    let mut states = client.connection().watch_state();
    client.start();

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = client.status();
                info!(status = %status.connection, queued = status.queued_mutations, "connection");
                if let Some(error) = client.connection().last_error() {
                    warn!(error = %error, "giving up on the connection");
                }
            }
        }
    }

    client.shutdown();
    Ok(())
}
