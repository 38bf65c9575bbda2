//! Durable backing stores for the delivery queue.
//!
//! The retry/backoff algorithm in [`super::DeliveryQueue`] is independent
//! of the storage substrate: anything implementing [`QueueStore`] works.
//! [`FileQueueStore`] is the production store (one JSON file, replaced
//! atomically via write-then-rename); [`MemoryQueueStore`] backs tests and
//! ephemeral sessions.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use super::QueuedDelivery;

/// Errors from the durable queue store.
#[derive(Debug, thiserror::Error)]
pub enum QueueStoreError {
    #[error("queue store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Durable persistence for queue entries: append, update, remove, load.
pub trait QueueStore: Send + Sync {
    fn append(&self, entry: &QueuedDelivery) -> Result<(), QueueStoreError>;

    /// Persist an updated retry count for an existing entry.
    fn update(&self, entry: &QueuedDelivery) -> Result<(), QueueStoreError>;

    fn remove(&self, id: &str) -> Result<(), QueueStoreError>;

    /// All entries in enqueue order. Called once at startup so queue state
    /// survives a process restart.
    fn load(&self) -> Result<Vec<QueuedDelivery>, QueueStoreError>;
}

/// JSON-file-backed queue store.
///
/// Every mutation rewrites the whole file through a temp-file rename, so a
/// crash mid-write leaves the previous consistent snapshot in place. Entry
/// counts are bounded by the queue's capacity, which keeps full rewrites
/// cheap.
pub struct FileQueueStore {
    path: PathBuf,
    // Serializes read-modify-write cycles across tasks.
    lock: Mutex<()>,
}

impl FileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_entries(&self) -> Result<Vec<QueuedDelivery>, QueueStoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_entries(&self, entries: &[QueuedDelivery]) -> Result<(), QueueStoreError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl QueueStore for FileQueueStore {
    fn append(&self, entry: &QueuedDelivery) -> Result<(), QueueStoreError> {
        let _guard = self.lock.lock().expect("queue store lock poisoned");
        let mut entries = self.read_entries()?;
        entries.retain(|e| e.id != entry.id);
        entries.push(entry.clone());
        self.write_entries(&entries)
    }

    fn update(&self, entry: &QueuedDelivery) -> Result<(), QueueStoreError> {
        let _guard = self.lock.lock().expect("queue store lock poisoned");
        let mut entries = self.read_entries()?;
        for existing in &mut entries {
            if existing.id == entry.id {
                *existing = entry.clone();
            }
        }
        self.write_entries(&entries)
    }

    fn remove(&self, id: &str) -> Result<(), QueueStoreError> {
        let _guard = self.lock.lock().expect("queue store lock poisoned");
        let mut entries = self.read_entries()?;
        entries.retain(|e| e.id != id);
        self.write_entries(&entries)
    }

    fn load(&self) -> Result<Vec<QueuedDelivery>, QueueStoreError> {
        let _guard = self.lock.lock().expect("queue store lock poisoned");
        self.read_entries()
    }
}

/// In-memory queue store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryQueueStore {
    entries: Mutex<Vec<QueuedDelivery>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn append(&self, entry: &QueuedDelivery) -> Result<(), QueueStoreError> {
        let mut entries = self.entries.lock().expect("queue store lock poisoned");
        entries.retain(|e| e.id != entry.id);
        entries.push(entry.clone());
        Ok(())
    }

    fn update(&self, entry: &QueuedDelivery) -> Result<(), QueueStoreError> {
        let mut entries = self.entries.lock().expect("queue store lock poisoned");
        for existing in entries.iter_mut() {
            if existing.id == entry.id {
                *existing = entry.clone();
            }
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), QueueStoreError> {
        self.entries
            .lock()
            .expect("queue store lock poisoned")
            .retain(|e| e.id != id);
        Ok(())
    }

    fn load(&self) -> Result<Vec<QueuedDelivery>, QueueStoreError> {
        Ok(self
            .entries
            .lock()
            .expect("queue store lock poisoned")
            .clone())
    }
}
