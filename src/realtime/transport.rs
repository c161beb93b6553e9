//! Transport boundary consumed by the connection manager
//!
//! A transport moves [`Frame`]s over some duplex channel. It reports what
//! happens to the channel through [`TransportEvents`]; the manager consumes
//! those events on a single task, so implementations never call back into
//! the manager directly.

use tokio::sync::mpsc;

use crate::protocol::Frame;
use crate::types::Result;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away, used when the manager tears down a failed session
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// What happened on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(Frame),
    Closed { code: u16, clean: bool },
    Error(String),
}

/// Event sink handed to [`Transport::open`], tagged with the generation of
/// the session it belongs to
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event. Returns false once the manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    pub fn open(&self) -> bool {
        self.emit(TransportEvent::Open)
    }

    pub fn message(&self, frame: Frame) -> bool {
        self.emit(TransportEvent::Message(frame))
    }

    pub fn closed(&self, code: u16, clean: bool) -> bool {
        self.emit(TransportEvent::Closed { code, clean })
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Error(reason.into()))
    }
}

/// Abstract duplex channel.
///
/// All methods must return without blocking: `open` starts connecting in the
/// background, `send` hands the frame off, `close` starts the close
/// handshake. At most one session is active; `open` replaces any previous
/// one.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: &str, events: TransportEvents);

    fn send(&self, frame: Frame) -> Result<()>;

    fn close(&self, code: u16, reason: &str);
}
