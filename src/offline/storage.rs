//! Key/value persistence for the offline queue

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::types::{Result, SyncError};
use crate::utils::{atomic_write, cleanup_temp_files, remove_if_exists};

/// Durable byte store addressed by key.
///
/// Calls happen while the queue holds its lock, so implementations must be
/// synchronous and quick.
pub trait Storage: Send + Sync + 'static {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite the value under `key`
    fn save(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Remove `key`. Missing keys are not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local storage. Survives nothing, useful for tests and hosts
/// without a data directory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One file per key under a data directory, written atomically
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open `dir`, creating it and removing leftovers from interrupted writes
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| SyncError::Storage(format!("{}: {}", dir.display(), e)))?;

        let cleaned = cleanup_temp_files(&dir)?;
        if cleaned > 0 {
            info!(dir = %dir.display(), cleaned, "removed interrupted writes");
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(SyncError::Storage(format!("invalid storage key '{}'", key)));
        }
        Ok(self.dir.join(format!("{}.bin", key)))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        atomic_write(&path, bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "saved");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        remove_if_exists(self.path(key)?)?;
        Ok(())
    }
}
