//! Offline write support
//!
//! - `OfflineQueue`: persisted FIFO of writes replayed when back online
//! - `Storage`: where the queue is persisted (`MemoryStorage`, `FileStorage`)
//! - `NetworkMonitor`: owner of the online/offline signal

mod network;
mod queue;
mod storage;

pub use network::NetworkMonitor;
pub use queue::{
    decode_persisted, encode_persisted, MutationExecutor, OfflineConfig, OfflineQueue,
    ReplayReport, WriteFailure, WriteOutcome, DEFAULT_STORAGE_KEY,
};
pub use storage::{FileStorage, MemoryStorage, Storage};
