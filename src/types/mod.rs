//! Data types shared across the sync layer
//!
//! This module contains the connection state machine types, the queued
//! mutation record, and the error taxonomy.

mod connection;
mod error;
mod mutation;

pub use connection::{ConnectionState, ConnectionStats, ConnectionStatus};
pub use error::SyncError;
pub use mutation::QueuedMutation;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
