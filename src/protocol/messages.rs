//! Wire message types for the realtime channel

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Message kinds with built-in meaning
pub mod kinds {
    pub const BATCH: &str = "batch";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const SERVICE_UPDATE: &str = "service_update";
    pub const METRICS_UPDATE: &str = "metrics_update";
    pub const USER_UPDATE: &str = "user_update";
    pub const LOG_ENTRY: &str = "log_entry";
}

/// Delivery priority. `High` and `Critical` take the batcher's fast lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn is_urgent(&self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }
}

/// A single logical message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    /// Unix timestamp (ms) when the message was created
    pub timestamp: i64,
    #[serde(default)]
    pub priority: Priority,
}

impl Message {
    /// Create a normal-priority message stamped with the current time
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Heartbeat probe
    pub fn ping() -> Self {
        Self::new(kinds::PING, Value::Null).with_priority(Priority::High)
    }

    pub fn subscribe(channel: &str) -> Self {
        Self::new(kinds::SUBSCRIBE, json!({ "channel": channel })).with_priority(Priority::High)
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self::new(kinds::UNSUBSCRIBE, json!({ "channel": channel }))
            .with_priority(Priority::High)
    }
}

/// Several messages sent as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEnvelope {
    /// Always `"batch"`
    pub kind: String,
    pub messages: Vec<Message>,
    pub count: usize,
    pub timestamp: i64,
    /// Out-of-band: mirrors the flag of the frame that carried the envelope
    #[serde(skip)]
    pub compressed: bool,
}

impl BatchEnvelope {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            kind: kinds::BATCH.to_string(),
            count: messages.len(),
            messages,
            timestamp: chrono::Utc::now().timestamp_millis(),
            compressed: false,
        }
    }

    /// Rebuild the envelope with the compression flag of its frame
    pub fn sealed(self, compressed: bool) -> Self {
        Self { compressed, ..self }
    }
}

/// Bytes moved by the transport, with the compression flag beside them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub compressed: bool,
}

impl Frame {
    pub fn plain(payload: Vec<u8>) -> Self {
        Self {
            payload,
            compressed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Single(Message),
    Batch(BatchEnvelope),
}

impl Inbound {
    /// Flatten into individual messages, preserving envelope order
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Inbound::Single(message) => vec![message],
            Inbound::Batch(envelope) => envelope.messages,
        }
    }
}
