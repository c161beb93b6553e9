//! WebSocket transport over tokio-tungstenite
//!
//! Each `open` spawns one session task that owns the socket. Plain frames
//! travel as text messages and compressed frames as binary messages, so the
//! compression flag survives the trip without touching the payload.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};

use super::transport::{Transport, TransportEvents, CLOSE_ABNORMAL, CLOSE_NORMAL};
use crate::protocol::Frame;
use crate::types::{Result, SyncError};

enum Command {
    Send(Frame),
    Close { code: u16, reason: String },
}

struct Session {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// [`Transport`] backed by a real WebSocket connection
#[derive(Default)]
pub struct WebSocketTransport {
    session: Mutex<Option<Session>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &str, events: TransportEvents) {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(url.to_string(), events, rx));

        let previous = self.session.lock().replace(Session { commands, task });
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    fn send(&self, frame: Frame) -> Result<()> {
        let session = self.session.lock();
        let session = session
            .as_ref()
            .ok_or_else(|| SyncError::Transport("no open session".to_string()))?;
        session
            .commands
            .send(Command::Send(frame))
            .map_err(|_| SyncError::Transport("session has ended".to_string()))
    }

    fn close(&self, code: u16, reason: &str) {
        if let Some(session) = self.session.lock().take() {
            let close = Command::Close {
                code,
                reason: reason.to_string(),
            };
            if session.commands.send(close).is_err() {
                session.task.abort();
            }
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.task.abort();
        }
    }
}

fn to_ws(frame: Frame) -> WsMessage {
    if frame.compressed {
        return WsMessage::Binary(frame.payload);
    }
    match String::from_utf8(frame.payload) {
        Ok(text) => WsMessage::Text(text),
        Err(e) => WsMessage::Binary(e.into_bytes()),
    }
}

async fn run_session(
    url: String,
    events: TransportEvents,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let generation = events.generation();
    let socket = match connect_async(url.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            debug!(url = %url, generation, error = %e, "websocket connect failed");
            events.error(e.to_string());
            return;
        }
    };
    events.open();

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => {
                    if let Err(e) = sink.send(to_ws(frame)).await {
                        warn!(generation, error = %e, "websocket send failed");
                        events.error(e.to_string());
                        return;
                    }
                }
                Some(Command::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                    let _ = sink.close().await;
                    return;
                }
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    events.message(Frame::plain(text.into_bytes()));
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    events.message(Frame {
                        payload: data,
                        compressed: true,
                    });
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_NORMAL);
                    debug!(generation, code, "websocket closed by peer");
                    events.closed(code, code == CLOSE_NORMAL);
                    return;
                }
                Some(Ok(_)) => trace!(generation, "control frame"),
                Some(Err(e)) => {
                    events.error(e.to_string());
                    return;
                }
                None => {
                    events.closed(CLOSE_ABNORMAL, false);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_frames_travel_as_binary() {
        let frame = Frame {
            payload: vec![0x1f, 0x8b, 0x08],
            compressed: true,
        };
        assert!(matches!(to_ws(frame), WsMessage::Binary(_)));
    }

    #[test]
    fn test_plain_frames_travel_as_text() {
        let frame = Frame::plain(br#"{"kind":"ping"}"#.to_vec());
        assert_eq!(to_ws(frame), WsMessage::Text(r#"{"kind":"ping"}"#.to_string()));
    }

    #[test]
    fn test_send_without_session_fails() {
        let transport = WebSocketTransport::new();
        let result = transport.send(Frame::plain(b"{}".to_vec()));
        assert!(matches!(result, Err(SyncError::Transport(_))));
    }
}
