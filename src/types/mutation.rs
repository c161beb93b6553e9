//! Queued write operations

use serde::{Deserialize, Serialize};

/// A write captured while offline, waiting for replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    pub id: String,
    /// Endpoint or resource identifier, e.g. `containers/abc/restart`
    pub target: String,
    pub body: Vec<u8>,
    /// Unix timestamp (ms)
    pub enqueued_at: i64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedMutation {
    /// Create a mutation with a fresh id
    pub fn new(target: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.into(),
            body,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Record a failed replay attempt
    pub fn record_failure(&mut self, reason: &str) {
        self.attempts += 1;
        self.last_error = Some(reason.to_string());
    }
}
