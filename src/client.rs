//! Sync client
//!
//! Wires the components together the way a dashboard uses them: one
//! connection feeding the dashboard cache, a batcher in front of it, and an
//! offline queue replayed whenever the host reports connectivity.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::DashboardCache;
use crate::config::SyncConfig;
use crate::offline::{
    FileStorage, MemoryStorage, MutationExecutor, OfflineQueue, Storage, WriteOutcome,
};
use crate::protocol::{Message, MessageCodec};
use crate::realtime::{
    ConnectionManager, MessageBatcher, SendOutcome, SubscriberId, Transport,
};
use crate::types::{ConnectionStatus, Result};

/// Everything a status bar needs in one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub connection: ConnectionStatus,
    /// Writes waiting for replay
    pub queued_mutations: usize,
    /// Messages waiting in the batcher
    pub pending_messages: usize,
}

pub struct SyncClient {
    config: SyncConfig,
    connection: ConnectionManager,
    batcher: MessageBatcher,
    dashboard: Arc<DashboardCache>,
    offline: Arc<OfflineQueue>,
    replayer: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    /// Build every component from `config`.
    ///
    /// The offline queue is persisted under `config.data_dir` when set and
    /// kept in memory otherwise. Must be called within a Tokio runtime.
    pub fn new<T: Transport>(
        config: SyncConfig,
        transport: T,
        executor: Arc<dyn MutationExecutor>,
        online: watch::Receiver<bool>,
    ) -> Result<Self> {
        let storage: Arc<dyn Storage> = match &config.data_dir {
            Some(dir) => Arc::new(FileStorage::open(dir)?),
            None => Arc::new(MemoryStorage::new()),
        };
        Self::with_storage(config, transport, executor, online, storage)
    }

    pub fn with_storage<T: Transport>(
        config: SyncConfig,
        transport: T,
        executor: Arc<dyn MutationExecutor>,
        online: watch::Receiver<bool>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;
        let codec = MessageCodec::new(config.codec.clone());

        let connection =
            ConnectionManager::with_codec(config.connection.clone(), codec.clone(), transport);
        let dashboard = Arc::new(DashboardCache::with_config(config.dashboard.clone()));
        connection.set_live_updates(dashboard.clone());

        let batcher = MessageBatcher::new(config.batcher.clone(), codec.clone(), connection.clone());
        let offline = Arc::new(OfflineQueue::open(
            config.offline.clone(),
            codec,
            storage,
            executor,
            online,
        )?);

        Ok(Self {
            config,
            connection,
            batcher,
            dashboard,
            offline,
            replayer: Mutex::new(None),
        })
    }

    /// Connect, start cache sweepers and the offline replayer
    pub fn start(&self) {
        info!(url = %self.config.connection.url, "starting sync client");
        self.connection.connect();
        self.dashboard.start_sweepers();

        let mut replayer = self.replayer.lock();
        if replayer.is_none() {
            *replayer = Some(self.offline.spawn_replayer());
        }
    }

    /// Flush pending batches, close the connection and stop background tasks
    pub fn shutdown(&self) {
        let flushed = self.batcher.flush_all();
        self.connection.disconnect();
        self.dashboard.stop_sweepers();
        if let Some(replayer) = self.replayer.lock().take() {
            replayer.abort();
        }
        info!(flushed = flushed.len(), "sync client stopped");
    }

    /// Queue a message for batched delivery
    pub fn send(&self, message: Message) {
        self.batcher.enqueue(message);
    }

    /// Bypass the batcher
    pub fn send_now(&self, message: &Message) -> Result<SendOutcome> {
        self.connection.send(message)
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriberId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.connection.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.connection.unsubscribe(id)
    }

    /// Perform a write, or queue it for replay when offline
    pub async fn write(&self, target: &str, body: Vec<u8>) -> Result<WriteOutcome> {
        self.offline.write(target, body).await
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            connection: self.connection.status(),
            queued_mutations: self.offline.size(),
            pending_messages: self.batcher.pending(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn batcher(&self) -> &MessageBatcher {
        &self.batcher
    }

    pub fn dashboard(&self) -> &Arc<DashboardCache> {
        &self.dashboard
    }

    pub fn offline(&self) -> &Arc<OfflineQueue> {
        &self.offline
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(replayer) = self.replayer.get_mut().take() {
            replayer.abort();
        }
    }
}
