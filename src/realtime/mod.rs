//! Realtime channel: connection lifecycle, batching and fan-out

mod backoff;
mod batcher;
mod manager;
mod subscribers;
mod transport;
mod websocket;

pub use backoff::Backoff;
pub use batcher::{BatchStats, BatcherConfig, MessageBatcher, Outbound};
pub use manager::{ConnectionConfig, ConnectionManager, SendOutcome};
pub use subscribers::{MessageHandler, SubscriberId, Subscribers};
pub use transport::{
    Transport, TransportEvent, TransportEvents, CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_NORMAL,
};
pub use websocket::WebSocketTransport;
