//! Connection manager
//!
//! Owns the duplex channel lifecycle:
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!                                 |                   |
//!                      error/timeout         close(non-clean)/error
//!                                 v                   v
//!                   Closed <--exhausted-- Reconnecting --backoff--> Connecting
//! ```
//!
//! Every state change happens under one mutex. Transport events arrive on a
//! channel drained by a single pump task, and each transport session carries
//! a generation number so events from a torn-down session are dropped.
//! Timers (heartbeat, backoff, connect timeout) are spawned tasks owned by
//! the manager and aborted when they stop being relevant.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, trace, warn};

use super::backoff::Backoff;
use super::subscribers::{SubscriberId, Subscribers};
use super::transport::{
    Transport, TransportEvent, TransportEvents, CLOSE_GOING_AWAY, CLOSE_NORMAL,
};
use crate::cache::{Domain, LiveUpdateSink};
use crate::protocol::{kinds, Frame, Message, MessageCodec};
use crate::types::{ConnectionState, ConnectionStats, ConnectionStatus, Result, SyncError};

/// Connection manager settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoint handed to [`Transport::open`]
    pub url: String,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
    /// How long `Connecting` may last before it counts as a failure
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay, self.max_attempts)
    }
}

/// What `send` did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport
    Sent,
    /// Buffered until the next `Connected` transition
    Queued,
}

#[derive(Default)]
struct Timers {
    heartbeat: Option<JoinHandle<()>>,
    backoff: Option<JoinHandle<()>>,
    connect_timeout: Option<JoinHandle<()>>,
}

impl Timers {
    fn cancel_all(&mut self) {
        cancel(&mut self.heartbeat);
        cancel(&mut self.backoff);
        cancel(&mut self.connect_timeout);
    }
}

fn cancel(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

struct Core {
    state: ConnectionState,
    generation: u64,
    outbound: VecDeque<Frame>,
    stats: ConnectionStats,
    channels: BTreeSet<String>,
    timers: Timers,
}

struct Shared {
    me: Weak<Shared>,
    config: ConnectionConfig,
    backoff: Backoff,
    codec: MessageCodec,
    transport: Box<dyn Transport>,
    core: Mutex<Core>,
    subscribers: Subscribers,
    live_updates: Mutex<Option<Arc<dyn LiveUpdateSink>>>,
    state_tx: watch::Sender<ConnectionState>,
    error_tx: watch::Sender<Option<SyncError>>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the connection manager. Clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager in `Disconnected` state.
    ///
    /// Must be called from within a Tokio runtime: it spawns the task that
    /// consumes transport events.
    pub fn new<T: Transport>(config: ConnectionConfig, transport: T) -> Self {
        Self::with_codec(config, MessageCodec::default(), transport)
    }

    pub fn with_codec<T: Transport>(
        config: ConnectionConfig,
        codec: MessageCodec,
        transport: T,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (error_tx, _) = watch::channel(None);

        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            backoff: config.backoff(),
            config,
            codec,
            transport: Box::new(transport),
            core: Mutex::new(Core {
                state: ConnectionState::Disconnected,
                generation: 0,
                outbound: VecDeque::new(),
                stats: ConnectionStats::default(),
                channels: BTreeSet::new(),
                timers: Timers::default(),
            }),
            subscribers: Subscribers::new(),
            live_updates: Mutex::new(None),
            state_tx,
            error_tx,
            events_tx,
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(pump_events(Arc::downgrade(&shared), events_rx));
        *shared.pump.lock() = Some(pump);

        Self { shared }
    }

    /// Route service/metrics/user deltas and log lines into `sink`
    pub fn set_live_updates(&self, sink: Arc<dyn LiveUpdateSink>) {
        *self.shared.live_updates.lock() = Some(sink);
    }

    /// Start connecting. No-op while already connecting or connected.
    /// From `Closed` this clears the terminal error and the attempt counter.
    pub fn connect(&self) {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        match core.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!(state = %core.state, "connect ignored");
                return;
            }
            ConnectionState::Closed => {
                core.stats.reconnect_attempts = 0;
                shared.error_tx.send_replace(None);
            }
            ConnectionState::Reconnecting => cancel(&mut core.timers.backoff),
            ConnectionState::Disconnected => {}
        }
        shared.begin_connect(&mut core);
    }

    /// Clean, caller-initiated close. Queued frames are kept for the next
    /// connection.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        core.timers.cancel_all();
        if matches!(
            core.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            shared.transport.close(CLOSE_NORMAL, "client disconnect");
        }
        core.generation += 1;
        shared.set_state(&mut core, ConnectionState::Disconnected);
    }

    /// Tear down the transport, reset counters and connect again right away.
    /// Cancels any pending backoff.
    pub fn force_reconnect(&self) {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        core.timers.cancel_all();
        if matches!(
            core.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            shared.transport.close(CLOSE_NORMAL, "force reconnect");
        }
        core.generation += 1;
        core.stats = ConnectionStats::default();
        shared.error_tx.send_replace(None);
        info!("forcing reconnect");
        shared.begin_connect(&mut core);
    }

    /// Encode and send. Transmits now when connected, otherwise buffers.
    pub fn send(&self, message: &Message) -> Result<SendOutcome> {
        let frame = self.shared.codec.encode_message(message)?;
        Ok(self.send_frame(frame))
    }

    /// Send a pre-encoded frame. Never blocks.
    pub fn send_frame(&self, frame: Frame) -> SendOutcome {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        if !core.state.is_connected() {
            core.outbound.push_back(frame);
            return SendOutcome::Queued;
        }
        // A failed transmit puts the frame back at the head of the queue
        if shared.transmit(&mut core, frame) {
            SendOutcome::Sent
        } else {
            SendOutcome::Queued
        }
    }

    /// Register a handler for every inbound message except `pong`
    pub fn subscribe<F>(&self, handler: F) -> SubscriberId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.shared.subscribers.unsubscribe(id)
    }

    /// Join a server-side channel. Re-sent after every reconnect.
    pub fn subscribe_channel(&self, channel: &str) -> Result<()> {
        let frame = self.shared.codec.encode_message(&Message::subscribe(channel))?;
        let shared = &self.shared;
        let mut core = shared.core.lock();
        if core.channels.insert(channel.to_string()) && core.state.is_connected() {
            shared.transmit(&mut core, frame);
        }
        Ok(())
    }

    pub fn unsubscribe_channel(&self, channel: &str) -> Result<()> {
        let frame = self
            .shared
            .codec
            .encode_message(&Message::unsubscribe(channel))?;
        let shared = &self.shared;
        let mut core = shared.core.lock();
        if core.channels.remove(channel) && core.state.is_connected() {
            shared.transmit(&mut core, frame);
        }
        Ok(())
    }

    pub fn channels(&self) -> Vec<String> {
        self.shared.core.lock().channels.iter().cloned().collect()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.core.lock().stats.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        let core = self.shared.core.lock();
        ConnectionStatus {
            state: core.state,
            attempt: core.stats.reconnect_attempts,
            max_attempts: self.shared.backoff.max_attempts,
            queued_frames: core.outbound.len(),
        }
    }

    /// Frames waiting for the next connection
    pub fn queued_frames(&self) -> usize {
        self.shared.core.lock().outbound.len()
    }

    pub fn heartbeat_active(&self) -> bool {
        self.shared.core.lock().timers.heartbeat.is_some()
    }

    /// Terminal error store. Holds `ExhaustedRetries` once the manager gives up.
    pub fn errors(&self) -> watch::Receiver<Option<SyncError>> {
        self.shared.error_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.shared.error_tx.borrow().clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }
}

impl Shared {
    fn set_state(&self, core: &mut Core, state: ConnectionState) {
        if core.state == state {
            return;
        }
        debug!(from = %core.state, to = %state, "connection state transition");
        core.state = state;
        self.state_tx.send_replace(state);
    }

    fn begin_connect(&self, core: &mut Core) {
        cancel(&mut core.timers.backoff);
        cancel(&mut core.timers.connect_timeout);
        core.generation += 1;
        self.set_state(core, ConnectionState::Connecting);

        let generation = core.generation;
        let timeout = self.config.connect_timeout;
        let me = self.me.clone();
        core.timers.connect_timeout = Some(tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(shared) = me.upgrade() {
                shared.on_connect_timeout(generation);
            }
        }));

        debug!(url = %self.config.url, generation, "opening transport");
        let events = TransportEvents::new(generation, self.events_tx.clone());
        self.transport.open(&self.config.url, events);
    }

    fn handle_event(&self, generation: u64, event: TransportEvent) {
        let mut core = self.core.lock();
        if generation != core.generation {
            trace!(generation, current = core.generation, "dropping stale transport event");
            return;
        }

        match event {
            TransportEvent::Open => self.on_open(&mut core),
            TransportEvent::Message(frame) => {
                drop(core);
                self.dispatch(frame);
            }
            TransportEvent::Closed { code, clean } => self.on_closed(&mut core, code, clean),
            TransportEvent::Error(reason) => {
                if core.state.is_pending() || core.state.is_connected() {
                    self.on_failure(&mut core, SyncError::Transport(reason));
                }
            }
        }
    }

    fn on_open(&self, core: &mut Core) {
        if core.state != ConnectionState::Connecting {
            debug!(state = %core.state, "ignoring open outside of connecting");
            return;
        }
        cancel(&mut core.timers.connect_timeout);
        core.stats.reconnect_attempts = 0;
        core.stats.last_connected_at = Some(chrono::Utc::now().timestamp_millis());
        self.set_state(core, ConnectionState::Connected);
        info!(url = %self.config.url, queued = core.outbound.len(), "connected");

        while let Some(frame) = core.outbound.pop_front() {
            if !self.transmit(core, frame) {
                return;
            }
        }

        self.arm_heartbeat(core);

        let channels: Vec<String> = core.channels.iter().cloned().collect();
        for channel in channels {
            match self.codec.encode_message(&Message::subscribe(&channel)) {
                Ok(frame) => {
                    if !self.transmit(core, frame) {
                        return;
                    }
                }
                Err(e) => warn!(channel = %channel, error = %e, "failed to encode subscribe"),
            }
        }
    }

    fn on_closed(&self, core: &mut Core, code: u16, clean: bool) {
        match core.state {
            ConnectionState::Connected if clean => {
                info!(code, "server closed the connection");
                core.timers.cancel_all();
                core.generation += 1;
                self.set_state(core, ConnectionState::Disconnected);
            }
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.on_failure(
                    core,
                    SyncError::Transport(format!("connection closed with code {}", code)),
                );
            }
            state => debug!(code, state = %state, "close event ignored"),
        }
    }

    fn on_connect_timeout(&self, generation: u64) {
        let mut core = self.core.lock();
        core.timers.connect_timeout.take();
        if core.generation != generation || core.state != ConnectionState::Connecting {
            return;
        }
        let error = SyncError::Timeout(format!(
            "no open within {} ms",
            self.config.connect_timeout.as_millis()
        ));
        self.on_failure(&mut core, error);
    }

    /// Tear the session down and either schedule a reconnect or give up
    fn on_failure(&self, core: &mut Core, error: SyncError) {
        cancel(&mut core.timers.heartbeat);
        cancel(&mut core.timers.connect_timeout);
        self.transport.close(CLOSE_GOING_AWAY, &error.to_string());
        core.generation += 1;

        let attempts = core.stats.reconnect_attempts;
        if !self.backoff.has_remaining(attempts) {
            error!(attempts, error = %error, "reconnect attempts exhausted");
            self.set_state(core, ConnectionState::Closed);
            self.error_tx
                .send_replace(Some(SyncError::ExhaustedRetries { attempts }));
            return;
        }

        let attempt = attempts + 1;
        core.stats.reconnect_attempts = attempt;
        let delay = self.backoff.delay(attempt);
        self.set_state(core, ConnectionState::Reconnecting);
        warn!(
            attempt,
            max_attempts = self.backoff.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "connection lost, scheduling reconnect"
        );

        let generation = core.generation;
        let me = self.me.clone();
        core.timers.backoff = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(shared) = me.upgrade() {
                shared.on_backoff_elapsed(generation);
            }
        }));
    }

    fn on_backoff_elapsed(&self, generation: u64) {
        let mut core = self.core.lock();
        core.timers.backoff.take();
        if core.generation != generation || core.state != ConnectionState::Reconnecting {
            return;
        }
        self.begin_connect(&mut core);
    }

    fn arm_heartbeat(&self, core: &mut Core) {
        cancel(&mut core.timers.heartbeat);
        let period = self.config.heartbeat_interval;
        let generation = core.generation;
        let me = self.me.clone();
        core.timers.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(shared) = me.upgrade() else {
                    break;
                };
                if !shared.heartbeat(generation) {
                    break;
                }
            }
        }));
    }

    /// Send one ping. Returns false when the heartbeat should stop.
    fn heartbeat(&self, generation: u64) -> bool {
        let mut core = self.core.lock();
        if core.generation != generation || !core.state.is_connected() {
            return false;
        }
        match self.codec.encode_message(&Message::ping()) {
            Ok(frame) => {
                trace!("heartbeat ping");
                self.transmit(&mut core, frame)
            }
            Err(e) => {
                warn!(error = %e, "failed to encode ping");
                true
            }
        }
    }

    /// Hand a frame to the transport. On failure the frame goes back to the
    /// front of the outbound queue and the failure path runs; returns false.
    fn transmit(&self, core: &mut Core, frame: Frame) -> bool {
        match self.transport.send(frame.clone()) {
            Ok(()) => {
                core.stats.messages_sent += 1;
                true
            }
            Err(e) => {
                core.outbound.push_front(frame);
                self.on_failure(core, e);
                false
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        let inbound = match self.codec.decode_inbound(&frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, bytes = frame.len(), "dropping undecodable frame");
                return;
            }
        };

        let messages = inbound.into_messages();
        self.core.lock().stats.messages_received += messages.len() as u64;

        let sink = self.live_updates.lock().clone();
        for message in &messages {
            if message.kind == kinds::PONG {
                trace!("pong");
                continue;
            }
            if let Some(sink) = sink.as_deref() {
                route(sink, message);
            }
            self.subscribers.dispatch(message);
        }
    }
}

/// Internal handlers keyed by message kind
fn route(sink: &dyn LiveUpdateSink, message: &Message) {
    if message.kind == kinds::LOG_ENTRY {
        sink.append_log(message.payload.clone());
        return;
    }
    match Domain::from_kind(&message.kind) {
        Some(domain) => sink.apply_live_update(domain, message.payload.clone()),
        None => debug!(kind = %message.kind, "no internal handler for message kind"),
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.core.get_mut().timers.cancel_all();
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn pump_events(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
) {
    while let Some((generation, event)) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle_event(generation, event);
    }
}
