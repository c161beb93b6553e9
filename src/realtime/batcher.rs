//! Outbound message batching
//!
//! Coalesces messages into [`BatchEnvelope`]s on two lanes. `high` and
//! `critical` messages ride the priority lane with a short flush delay;
//! `low` and `normal` ride the normal lane, which also flushes as soon as it
//! reaches `batch_size` and is force-flushed at `max_queue_size`.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use super::manager::{ConnectionManager, SendOutcome};
use crate::protocol::{BatchEnvelope, Frame, Message, MessageCodec};

/// Where flushed envelopes go
pub trait Outbound: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    fn send_frame(&self, frame: Frame) -> SendOutcome;
}

impl Outbound for ConnectionManager {
    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }

    fn send_frame(&self, frame: Frame) -> SendOutcome {
        ConnectionManager::send_frame(self, frame)
    }
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Normal-lane size that triggers an immediate flush
    pub batch_size: usize,
    /// Lane size that forces a flush even while disconnected
    pub max_queue_size: usize,
    pub flush_delay: Duration,
    pub priority_flush_delay: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_queue_size: 50,
            flush_delay: Duration::from_millis(100),
            priority_flush_delay: Duration::from_millis(50),
        }
    }
}

impl BatcherConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size.max(1);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub messages_sent: u64,
    pub batches_sent: u64,
    /// Bytes saved by compression across all compressed envelopes
    pub compression_savings: u64,
    /// Flushes skipped because the connection was down
    pub requeued: u64,
}

impl BatchStats {
    pub fn average_batch_size(&self) -> f64 {
        if self.batches_sent == 0 {
            0.0
        } else {
            self.messages_sent as f64 / self.batches_sent as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneKind {
    Normal,
    Priority,
}

impl LaneKind {
    fn of(message: &Message) -> Self {
        if message.priority.is_urgent() {
            LaneKind::Priority
        } else {
            LaneKind::Normal
        }
    }

    fn index(self) -> usize {
        match self {
            LaneKind::Normal => 0,
            LaneKind::Priority => 1,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LaneKind::Normal => "normal",
            LaneKind::Priority => "priority",
        }
    }
}

#[derive(Default)]
struct Lane {
    queue: VecDeque<Message>,
    timer: Option<JoinHandle<()>>,
}

impl Lane {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Core {
    lanes: [Lane; 2],
    stats: BatchStats,
}

struct Shared {
    me: Weak<Shared>,
    config: BatcherConfig,
    codec: MessageCodec,
    outbound: Box<dyn Outbound>,
    core: Mutex<Core>,
}

/// Handle to the batcher. Clones share the same lanes.
#[derive(Clone)]
pub struct MessageBatcher {
    shared: Arc<Shared>,
}

impl MessageBatcher {
    pub fn new<O: Outbound>(config: BatcherConfig, codec: MessageCodec, outbound: O) -> Self {
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            config,
            codec,
            outbound: Box::new(outbound),
            core: Mutex::new(Core::default()),
        });
        Self { shared }
    }

    /// Queue a message for the next envelope on its lane.
    ///
    /// Arms the lane's flush timer when it is idle. Requires a Tokio runtime.
    pub fn enqueue(&self, message: Message) {
        let shared = &self.shared;
        let kind = LaneKind::of(&message);
        let mut core = shared.core.lock();

        let lane = &mut core.lanes[kind.index()];
        lane.queue.push_back(message);
        let queued = lane.queue.len();

        if queued >= shared.config.max_queue_size {
            debug!(lane = kind.as_str(), queued, "lane full, forcing flush");
            shared.flush_lane(&mut core, kind, true);
        } else if kind == LaneKind::Normal
            && queued >= shared.config.batch_size
            && shared.outbound.is_connected()
        {
            shared.flush_lane(&mut core, kind, false);
        } else if core.lanes[kind.index()].timer.is_none() {
            shared.arm_timer(&mut core, kind);
        }
    }

    /// Flush both lanes now, priority first. Lanes are left untouched while
    /// disconnected.
    pub fn flush_all(&self) -> Vec<BatchEnvelope> {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        [LaneKind::Priority, LaneKind::Normal]
            .into_iter()
            .filter_map(|kind| shared.flush_lane(&mut core, kind, false))
            .collect()
    }

    /// Messages waiting on either lane
    pub fn pending(&self) -> usize {
        let core = self.shared.core.lock();
        core.lanes.iter().map(|lane| lane.queue.len()).sum()
    }

    pub fn stats(&self) -> BatchStats {
        self.shared.core.lock().stats.clone()
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.shared.config
    }
}

impl Shared {
    fn delay(&self, kind: LaneKind) -> Duration {
        match kind {
            LaneKind::Normal => self.config.flush_delay,
            LaneKind::Priority => self.config.priority_flush_delay,
        }
    }

    fn arm_timer(&self, core: &mut Core, kind: LaneKind) {
        let delay = self.delay(kind);
        let me = self.me.clone();
        core.lanes[kind.index()].timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(shared) = me.upgrade() {
                shared.on_timer(kind);
            }
        }));
    }

    fn on_timer(&self, kind: LaneKind) {
        let mut core = self.core.lock();
        core.lanes[kind.index()].timer.take();
        self.flush_lane(&mut core, kind, false);
    }

    /// Drain a lane into one envelope and hand it to the outbound side.
    ///
    /// A soft flush leaves the lane as it is when not connected; the next
    /// enqueue rearms its timer. A hard flush sends regardless.
    fn flush_lane(&self, core: &mut Core, kind: LaneKind, hard: bool) -> Option<BatchEnvelope> {
        let lane = &mut core.lanes[kind.index()];
        lane.cancel_timer();
        if lane.queue.is_empty() {
            return None;
        }

        if !hard && !self.outbound.is_connected() {
            core.stats.requeued += 1;
            trace!(lane = kind.as_str(), pending = lane.queue.len(), "not connected, keeping batch");
            return None;
        }

        let envelope = BatchEnvelope::new(lane.queue.drain(..).collect());
        let encoded = match self.codec.encode(&envelope) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(lane = kind.as_str(), error = %e, "failed to encode batch");
                for message in envelope.messages.into_iter().rev() {
                    lane.queue.push_front(message);
                }
                return None;
            }
        };

        let compressed = encoded.frame.compressed;
        let savings = encoded.savings();
        let outcome = self.outbound.send_frame(encoded.frame);
        debug!(
            lane = kind.as_str(),
            count = envelope.count,
            compressed,
            outcome = ?outcome,
            "flushed batch"
        );

        let stats = &mut core.stats;
        stats.messages_sent += envelope.count as u64;
        stats.batches_sent += 1;
        stats.compression_savings += savings;

        Some(envelope.sealed(compressed))
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for lane in self.core.get_mut().lanes.iter_mut() {
            lane.cancel_timer();
        }
    }
}
