//! Offline mutation queue
//!
//! Writes that cannot reach the server are appended here and persisted as a
//! whole list under one storage key. When connectivity returns they are
//! replayed in enqueue order, one at a time; the first failure stops the
//! cycle and leaves the failed mutation at the head.
//!
//! The in-memory list and its persisted copy change together under one
//! lock. Replay never holds the lock across the executor call: it re-reads
//! the head before executing and finds the entry again by id afterwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::storage::Storage;
use crate::protocol::MessageCodec;
use crate::types::{QueuedMutation, Result, SyncError};

/// Storage key used when none is configured
pub const DEFAULT_STORAGE_KEY: &str = "offline-queue";

const PERSIST_VERSION: u32 = 1;
const FLAG_PLAIN: u8 = 0;
const FLAG_GZIP: u8 = 1;

/// Why a write did not go through
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteFailure {
    /// The server could not be reached. The write is worth retrying.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered and refused the write
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Performs a write against the REST API
pub trait MutationExecutor: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        target: &'a str,
        body: &'a [u8],
    ) -> BoxFuture<'a, std::result::Result<(), WriteFailure>>;
}

/// Result of [`OfflineQueue::write`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Sent,
    /// Stored for replay under this mutation id
    Queued { id: String },
    Rejected { reason: String },
}

/// Summary of one replay cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub remaining: usize,
    /// The failure that stopped the cycle, if any
    pub failure: Option<SyncError>,
    /// Another cycle was running or the queue was offline
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct OfflineConfig {
    pub storage_key: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

impl OfflineConfig {
    pub fn with_storage_key(key: impl Into<String>) -> Self {
        Self {
            storage_key: key.into(),
        }
    }
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    version: u32,
    mutations: &'a VecDeque<QueuedMutation>,
}

#[derive(Deserialize)]
struct Persisted {
    version: u32,
    mutations: VecDeque<QueuedMutation>,
}

/// Encode the list as `[flag][codec bytes]`
pub fn encode_persisted(
    codec: &MessageCodec,
    mutations: &VecDeque<QueuedMutation>,
) -> Result<Vec<u8>> {
    let encoded = codec.encode(&PersistedRef {
        version: PERSIST_VERSION,
        mutations,
    })?;
    let flag = if encoded.frame.compressed {
        FLAG_GZIP
    } else {
        FLAG_PLAIN
    };

    let mut bytes = Vec::with_capacity(encoded.frame.len() + 1);
    bytes.push(flag);
    bytes.extend_from_slice(&encoded.frame.payload);
    Ok(bytes)
}

pub fn decode_persisted(codec: &MessageCodec, bytes: &[u8]) -> Result<VecDeque<QueuedMutation>> {
    let (flag, body) = bytes
        .split_first()
        .ok_or_else(|| SyncError::Storage("persisted queue is empty".to_string()))?;
    let compressed = match *flag {
        FLAG_PLAIN => false,
        FLAG_GZIP => true,
        other => {
            return Err(SyncError::Storage(format!(
                "unknown persisted queue flag {}",
                other
            )))
        }
    };

    let persisted: Persisted = codec.decode(body, compressed)?;
    if persisted.version != PERSIST_VERSION {
        return Err(SyncError::Storage(format!(
            "unsupported persisted queue version {}",
            persisted.version
        )));
    }
    Ok(persisted.mutations)
}

/// Clears the replay flag when a cycle ends, however it ends
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OfflineQueue {
    config: OfflineConfig,
    codec: MessageCodec,
    storage: Arc<dyn Storage>,
    executor: Arc<dyn MutationExecutor>,
    mutations: Mutex<VecDeque<QueuedMutation>>,
    replaying: AtomicBool,
    online: watch::Receiver<bool>,
}

impl OfflineQueue {
    /// Load the persisted list and start from it.
    ///
    /// A persisted list that cannot be decoded is an error; it is never
    /// silently replaced.
    pub fn open(
        config: OfflineConfig,
        codec: MessageCodec,
        storage: Arc<dyn Storage>,
        executor: Arc<dyn MutationExecutor>,
        online: watch::Receiver<bool>,
    ) -> Result<Self> {
        let mutations = match storage.load(&config.storage_key)? {
            Some(bytes) => decode_persisted(&codec, &bytes)?,
            None => VecDeque::new(),
        };
        if !mutations.is_empty() {
            info!(pending = mutations.len(), key = %config.storage_key, "restored offline queue");
        }

        Ok(Self {
            config,
            codec,
            storage,
            executor,
            mutations: Mutex::new(mutations),
            replaying: AtomicBool::new(false),
            online,
        })
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn persist(&self, mutations: &VecDeque<QueuedMutation>) -> Result<()> {
        if mutations.is_empty() {
            return self.storage.delete(&self.config.storage_key);
        }
        let bytes = encode_persisted(&self.codec, mutations)?;
        self.storage.save(&self.config.storage_key, &bytes)
    }

    /// Append a mutation and persist the list. Nothing is kept if the
    /// persist fails.
    pub fn enqueue(&self, target: &str, body: Vec<u8>) -> Result<QueuedMutation> {
        let mutation = QueuedMutation::new(target, body);
        let mut mutations = self.mutations.lock();
        mutations.push_back(mutation.clone());

        if let Err(e) = self.persist(&mutations) {
            mutations.pop_back();
            error!(path = %target, error = %e, "failed to persist queued mutation");
            return Err(e);
        }

        info!(id = %mutation.id, path = %target, pending = mutations.len(), "mutation queued");
        Ok(mutation)
    }

    pub fn size(&self) -> usize {
        self.mutations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Snapshot in replay order
    pub fn pending(&self) -> Vec<QueuedMutation> {
        self.mutations.lock().iter().cloned().collect()
    }

    pub fn clear(&self) -> Result<()> {
        let mut mutations = self.mutations.lock();
        self.storage.delete(&self.config.storage_key)?;
        let dropped = mutations.len();
        mutations.clear();
        info!(dropped, "offline queue cleared");
        Ok(())
    }

    /// Execute now when online, otherwise queue. Network-class failures are
    /// queued too; rejections are reported back.
    pub async fn write(&self, target: &str, body: Vec<u8>) -> Result<WriteOutcome> {
        if !self.is_online() {
            let mutation = self.enqueue(target, body)?;
            return Ok(WriteOutcome::Queued { id: mutation.id });
        }

        match self.executor.execute(target, &body).await {
            Ok(()) => Ok(WriteOutcome::Sent),
            Err(WriteFailure::Network(reason)) => {
                warn!(path = %target, reason = %reason, "write failed, queueing for replay");
                let mutation = self.enqueue(target, body)?;
                Ok(WriteOutcome::Queued { id: mutation.id })
            }
            Err(WriteFailure::Rejected(reason)) => {
                warn!(path = %target, reason = %reason, "write rejected");
                Ok(WriteOutcome::Rejected { reason })
            }
        }
    }

    /// Run one replay cycle.
    ///
    /// Skipped when offline or when another cycle is already running.
    pub async fn replay(&self) -> ReplayReport {
        if !self.is_online()
            || self
                .replaying
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return ReplayReport {
                remaining: self.size(),
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = ReplayGuard(&self.replaying);

        let mut report = ReplayReport::default();
        loop {
            if !self.is_online() {
                debug!("went offline during replay");
                break;
            }
            let Some(head) = self.mutations.lock().front().cloned() else {
                break;
            };

            let result = self.executor.execute(&head.target, &head.body).await;

            let mut mutations = self.mutations.lock();
            let Some(position) = mutations.iter().position(|m| m.id == head.id) else {
                // cleared while executing
                continue;
            };

            match result {
                Ok(()) => {
                    mutations.remove(position);
                    report.replayed += 1;
                    debug!(id = %head.id, path = %head.target, "replayed mutation");
                    if let Err(e) = self.persist(&mutations) {
                        error!(error = %e, "failed to persist after replay");
                        report.failure = Some(e);
                        break;
                    }
                }
                Err(failure) => {
                    let reason = failure.to_string();
                    let entry = &mut mutations[position];
                    entry.record_failure(&reason);
                    let attempts = entry.attempts;
                    if let Err(e) = self.persist(&mutations) {
                        error!(error = %e, "failed to persist replay failure");
                    }
                    warn!(id = %head.id, attempts, reason = %reason, "replay stopped");
                    report.failure = Some(SyncError::Replay {
                        id: head.id.clone(),
                        attempts,
                        reason,
                    });
                    break;
                }
            }
        }

        report.remaining = self.size();
        if report.replayed > 0 || report.failure.is_some() {
            info!(
                replayed = report.replayed,
                remaining = report.remaining,
                failed = report.failure.is_some(),
                "replay cycle finished"
            );
        }
        report
    }

    /// Replay on every offline -> online transition, and once at start when
    /// already online with pending work. Ends when the signal's sender is
    /// dropped.
    pub async fn run(self: Arc<Self>) {
        let mut online = self.online.clone();
        let mut was_online = *online.borrow_and_update();
        if was_online && !self.is_empty() {
            self.replay().await;
        }

        while online.changed().await.is_ok() {
            let now_online = *online.borrow_and_update();
            if now_online && !was_online {
                self.replay().await;
            }
            was_online = now_online;
        }
    }

    pub fn spawn_replayer(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::{MemoryStorage, NetworkMonitor};
    use futures::FutureExt;
    use std::sync::Weak;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedExecutor {
        script: Mutex<VecDeque<std::result::Result<(), WriteFailure>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn with_script(script: Vec<std::result::Result<(), WriteFailure>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl MutationExecutor for ScriptedExecutor {
        fn execute<'a>(
            &'a self,
            target: &'a str,
            _body: &'a [u8],
        ) -> BoxFuture<'a, std::result::Result<(), WriteFailure>> {
            self.calls.lock().push(target.to_string());
            let result = self.script.lock().pop_front().unwrap_or(Ok(()));
            async move { result }.boxed()
        }
    }

    /// Acts on the queue from inside `execute` the first time `trigger` runs
    struct ReentrantExecutor {
        inner: Arc<ScriptedExecutor>,
        queue: Mutex<Weak<OfflineQueue>>,
        trigger: &'static str,
        fired: AtomicBool,
        action: fn(&OfflineQueue),
    }

    impl MutationExecutor for ReentrantExecutor {
        fn execute<'a>(
            &'a self,
            target: &'a str,
            body: &'a [u8],
        ) -> BoxFuture<'a, std::result::Result<(), WriteFailure>> {
            if target == self.trigger && !self.fired.swap(true, Ordering::SeqCst) {
                if let Some(queue) = self.queue.lock().upgrade() {
                    (self.action)(&queue);
                }
            }
            self.inner.execute(target, body)
        }
    }

    fn reentrant_queue(
        storage: Arc<MemoryStorage>,
        inner: Arc<ScriptedExecutor>,
        trigger: &'static str,
        action: fn(&OfflineQueue),
        monitor: &NetworkMonitor,
    ) -> Arc<OfflineQueue> {
        let executor = Arc::new(ReentrantExecutor {
            inner,
            queue: Mutex::new(Weak::new()),
            trigger,
            fired: AtomicBool::new(false),
            action,
        });
        let queue = Arc::new(
            OfflineQueue::open(
                OfflineConfig::default(),
                MessageCodec::default(),
                storage,
                executor.clone(),
                monitor.subscribe(),
            )
            .unwrap(),
        );
        *executor.queue.lock() = Arc::downgrade(&queue);
        queue
    }

    struct BrokenStorage;

    impl Storage for BrokenStorage {
        fn load(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn save(&self, _key: &str, _bytes: &[u8]) -> Result<()> {
            Err(SyncError::Storage("disk full".to_string()))
        }

        fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn queue(
        storage: Arc<dyn Storage>,
        executor: Arc<ScriptedExecutor>,
        monitor: &NetworkMonitor,
    ) -> OfflineQueue {
        OfflineQueue::open(
            OfflineConfig::default(),
            MessageCodec::default(),
            storage,
            executor,
            monitor.subscribe(),
        )
        .unwrap()
    }

    fn persisted_targets(storage: &MemoryStorage) -> Vec<String> {
        match storage.load(DEFAULT_STORAGE_KEY).unwrap() {
            Some(bytes) => decode_persisted(&MessageCodec::default(), &bytes)
                .unwrap()
                .into_iter()
                .map(|m| m.target)
                .collect(),
            None => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_replay_stops_at_first_failure() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = ScriptedExecutor::with_script(vec![
            Ok(()),
            Err(WriteFailure::Network("timeout".to_string())),
        ]);
        let monitor = NetworkMonitor::new(false);
        let queue = queue(storage.clone(), executor.clone(), &monitor);

        for target in ["a", "b", "c"] {
            queue.enqueue(target, b"{}".to_vec()).unwrap();
        }
        assert_eq!(persisted_targets(&storage), vec!["a", "b", "c"]);

        monitor.set_online(true);
        let report = queue.replay().await;

        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(executor.calls(), vec!["a", "b"]);
        assert_eq!(persisted_targets(&storage), vec!["b", "c"]);

        let head = &queue.pending()[0];
        assert_eq!(head.attempts, 1);
        assert_eq!(head.last_error.as_deref(), Some("network error: timeout"));
        assert_eq!(
            report.failure,
            Some(SyncError::Replay {
                id: head.id.clone(),
                attempts: 1,
                reason: "network error: timeout".to_string(),
            })
        );

        let report = queue.replay().await;
        assert_eq!(report.replayed, 2);
        assert!(queue.is_empty());
        assert!(!storage.contains(DEFAULT_STORAGE_KEY));
    }

    #[tokio::test]
    async fn test_replay_skipped_while_offline() {
        let executor = ScriptedExecutor::with_script(vec![]);
        let monitor = NetworkMonitor::new(false);
        let queue = queue(Arc::new(MemoryStorage::new()), executor.clone(), &monitor);
        queue.enqueue("a", vec![]).unwrap();

        let report = queue.replay().await;
        assert!(report.skipped);
        assert_eq!(report.remaining, 1);
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let storage = Arc::new(MemoryStorage::new());
        let monitor = NetworkMonitor::new(false);
        {
            let queue = queue(storage.clone(), ScriptedExecutor::with_script(vec![]), &monitor);
            queue.enqueue("services/web/restart", b"{\"force\":true}".to_vec()).unwrap();
            queue.enqueue("users/7", b"{}".to_vec()).unwrap();
        }

        let queue = queue(storage, ScriptedExecutor::with_script(vec![]), &monitor);
        let pending = queue.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].target, "services/web/restart");
        assert_eq!(pending[0].body, b"{\"force\":true}".to_vec());
    }

    #[test]
    fn test_unreadable_persisted_list_is_an_error() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save(DEFAULT_STORAGE_KEY, &[FLAG_PLAIN, b'{']).unwrap();
        let monitor = NetworkMonitor::new(false);

        let result = OfflineQueue::open(
            OfflineConfig::default(),
            MessageCodec::default(),
            storage,
            ScriptedExecutor::with_script(vec![]),
            monitor.subscribe(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_large_lists_persist_compressed() {
        let codec = MessageCodec::default();
        let mutations: VecDeque<QueuedMutation> = (0..20)
            .map(|n| QueuedMutation::new(format!("services/{}/restart", n), vec![b'x'; 64]))
            .collect();

        let bytes = encode_persisted(&codec, &mutations).unwrap();
        assert_eq!(bytes[0], FLAG_GZIP);
        assert_eq!(decode_persisted(&codec, &bytes).unwrap(), mutations);
    }

    #[test]
    fn test_enqueue_rolls_back_when_persist_fails() {
        let monitor = NetworkMonitor::new(false);
        let queue = queue(Arc::new(BrokenStorage), ScriptedExecutor::with_script(vec![]), &monitor);

        assert!(queue.enqueue("a", vec![]).is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_write_outcomes() {
        let executor = ScriptedExecutor::with_script(vec![
            Ok(()),
            Err(WriteFailure::Network("refused".to_string())),
            Err(WriteFailure::Rejected("409 conflict".to_string())),
        ]);
        let monitor = NetworkMonitor::new(true);
        let queue = queue(Arc::new(MemoryStorage::new()), executor, &monitor);

        assert_eq!(queue.write("a", vec![]).await.unwrap(), WriteOutcome::Sent);
        assert!(matches!(
            queue.write("b", vec![]).await.unwrap(),
            WriteOutcome::Queued { .. }
        ));
        assert_eq!(
            queue.write("c", vec![]).await.unwrap(),
            WriteOutcome::Rejected {
                reason: "409 conflict".to_string()
            }
        );
        assert_eq!(queue.size(), 1);

        monitor.set_online(false);
        assert!(matches!(
            queue.write("d", vec![]).await.unwrap(),
            WriteOutcome::Queued { .. }
        ));
        assert_eq!(queue.size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_replays_on_reconnect() {
        let executor = ScriptedExecutor::with_script(vec![]);
        let monitor = NetworkMonitor::new(false);
        let queue = Arc::new(queue(Arc::new(MemoryStorage::new()), executor.clone(), &monitor));
        queue.enqueue("a", vec![]).unwrap();

        let task = queue.spawn_replayer();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.size(), 1);

        monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_empty());
        assert_eq!(executor.calls(), vec!["a"]);

        task.abort();
    }

    #[tokio::test]
    async fn test_enqueue_during_replay_runs_in_same_cycle() {
        let storage = Arc::new(MemoryStorage::new());
        let inner = ScriptedExecutor::with_script(vec![]);
        let monitor = NetworkMonitor::new(false);
        let queue = reentrant_queue(
            storage.clone(),
            inner.clone(),
            "a",
            |queue| {
                queue.enqueue("d", vec![]).unwrap();
            },
            &monitor,
        );
        for target in ["a", "b", "c"] {
            queue.enqueue(target, vec![]).unwrap();
        }

        monitor.set_online(true);
        let report = queue.replay().await;

        assert_eq!(report.replayed, 4);
        assert_eq!(report.failure, None);
        assert_eq!(inner.calls(), vec!["a", "b", "c", "d"]);
        assert!(queue.is_empty());
        assert!(!storage.contains(DEFAULT_STORAGE_KEY));
    }

    #[tokio::test]
    async fn test_enqueue_during_failed_replay_is_kept_in_order() {
        let storage = Arc::new(MemoryStorage::new());
        let inner = ScriptedExecutor::with_script(vec![
            Ok(()),
            Ok(()),
            Err(WriteFailure::Network("503".to_string())),
        ]);
        let monitor = NetworkMonitor::new(false);
        let queue = reentrant_queue(
            storage.clone(),
            inner.clone(),
            "a",
            |queue| {
                queue.enqueue("d", vec![]).unwrap();
            },
            &monitor,
        );
        for target in ["a", "b", "c"] {
            queue.enqueue(target, vec![]).unwrap();
        }

        monitor.set_online(true);
        let report = queue.replay().await;

        assert_eq!(report.replayed, 2);
        assert!(matches!(report.failure, Some(SyncError::Replay { attempts: 1, .. })));
        let targets: Vec<String> = queue.pending().into_iter().map(|m| m.target).collect();
        assert_eq!(targets, vec!["c", "d"]);
        assert_eq!(persisted_targets(&storage), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_clear_during_replay_ends_cycle() {
        let storage = Arc::new(MemoryStorage::new());
        let inner = ScriptedExecutor::with_script(vec![]);
        let monitor = NetworkMonitor::new(false);
        let queue = reentrant_queue(
            storage.clone(),
            inner.clone(),
            "b",
            |queue| queue.clear().unwrap(),
            &monitor,
        );
        for target in ["a", "b", "c"] {
            queue.enqueue(target, vec![]).unwrap();
        }

        monitor.set_online(true);
        let report = queue.replay().await;

        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.failure, None);
        assert_eq!(inner.calls(), vec!["a", "b"]);
        assert!(queue.is_empty());
        assert!(!storage.contains(DEFAULT_STORAGE_KEY));
    }
}
