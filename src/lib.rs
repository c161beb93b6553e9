//! Dock Sync
//!
//! Client-side real-time synchronization and offline resilience for a
//! Docker management dashboard.
//!
//! # Features
//!
//! - **Resilient connection**: reconnect with exponential backoff, heartbeat,
//!   outbound buffering while disconnected, channel re-subscription
//! - **Batching**: two-lane coalescing of outbound messages with gzip above
//!   a size threshold
//! - **Offline writes**: persisted FIFO replayed in order when back online
//! - **Dashboard cache**: per-domain TTL caches fed by REST loaders and
//!   server-pushed updates
//!
//! # Modules
//!
//! - `types`: connection state, queued mutations, error taxonomy
//! - `protocol`: wire messages and the codec
//! - `cache`: TTL cache and dashboard state cache
//! - `realtime`: connection manager, batcher, transports
//! - `offline`: offline mutation queue and its storage
//! - `config`: aggregated settings read from the environment
//! - `client`: facade wiring everything together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dock_sync::{NetworkMonitor, SyncClient, SyncConfig, WebSocketTransport};
//! # use dock_sync::offline::{MutationExecutor, WriteFailure};
//! # use futures::future::BoxFuture;
//! # struct Rest;
//! # impl MutationExecutor for Rest {
//! #     fn execute<'a>(&'a self, _: &'a str, _: &'a [u8]) -> BoxFuture<'a, Result<(), WriteFailure>> {
//! #         Box::pin(async { Ok(()) })
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> dock_sync::Result<()> {
//!     let network = NetworkMonitor::new(true);
//!     let client = SyncClient::new(
//!         SyncConfig::from_env(),
//!         WebSocketTransport::new(),
//!         Arc::new(Rest),
//!         network.subscribe(),
//!     )?;
//!     client.start();
//!     client.connection().subscribe_channel("containers")?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod offline;
pub mod protocol;
pub mod realtime;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use cache::{DashboardCache, Domain, TtlCache};
pub use client::{ClientStatus, SyncClient};
pub use config::SyncConfig;
pub use offline::{NetworkMonitor, OfflineQueue, WriteOutcome};
pub use protocol::{Message, MessageCodec, Priority};
pub use realtime::{ConnectionManager, MessageBatcher, WebSocketTransport};
pub use types::{ConnectionState, Result, SyncError};
