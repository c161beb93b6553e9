//! Connection state and counters

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the duplex channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// Sends are transmitted immediately only in this state
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connection is in flight or waiting on backoff
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic connection counters, reset only by `force_reconnect`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Reconnect attempts since the last successful connect
    pub reconnect_attempts: u32,
    /// Unix timestamp (ms) of the last `Connected` transition
    pub last_connected_at: Option<i64>,
    pub messages_received: u64,
    pub messages_sent: u64,
}

/// Snapshot rendered by status bars: "reconnecting (attempt 2/5)"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub queued_frames: usize,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            ConnectionState::Reconnecting => write!(
                f,
                "reconnecting (attempt {}/{})",
                self.attempt, self.max_attempts
            ),
            ConnectionState::Closed => write!(
                f,
                "closed after {} failed attempts",
                self.max_attempts
            ),
            state => write!(f, "{}", state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let status = ConnectionStatus {
            state: ConnectionState::Reconnecting,
            attempt: 2,
            max_attempts: 5,
            queued_frames: 0,
        };
        assert_eq!(status.to_string(), "reconnecting (attempt 2/5)");

        let status = ConnectionStatus {
            state: ConnectionState::Connected,
            attempt: 0,
            max_attempts: 5,
            queued_frames: 0,
        };
        assert_eq!(status.to_string(), "connected");
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
    }
}
