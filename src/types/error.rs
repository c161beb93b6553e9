//! Error taxonomy for the sync layer

use thiserror::Error;

/// Errors raised by the sync layer.
///
/// `Clone` so the connection manager can publish the terminal error on a
/// watch channel and every observer gets its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Connect/send/receive failure on the transport. Recoverable, drives backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// A timer fired without the expected response (connect timeout).
    #[error("timed out: {0}")]
    Timeout(String),

    /// An outbound value could not be serialized or compressed
    #[error("encode error: {0}")]
    Encode(String),

    /// Malformed payload. The frame is dropped, the connection is unaffected.
    #[error("decode error: {0}")]
    Decode(String),

    /// Replay of a queued mutation failed. The mutation stays queued.
    #[error("replay of mutation {id} failed after {attempts} attempt(s): {reason}")]
    Replay {
        id: String,
        attempts: u32,
        reason: String,
    },

    /// Reconnection gave up. Terminal until `force_reconnect` or `connect`.
    #[error("gave up after {attempts} reconnect attempts")]
    ExhaustedRetries { attempts: u32 },

    /// Durable storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A dashboard loader failed
    #[error("loader failed: {0}")]
    Loader(String),
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}
