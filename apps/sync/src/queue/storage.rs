//! Durable key/value storage behind the offline queue.
//!
//! The queue only ever reads and writes one key, holding the whole ordered
//! list serialized as JSON. The medium is injected so tests can run against
//! [`MemoryQueueStorage`] without touching disk.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::SyncError;

pub trait QueueStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, SyncError>;
    fn write(&self, key: &str, value: &str) -> Result<(), SyncError>;
}

/// Stores each key as `<root>/<key>.json`. The directory is created on first write.
pub struct FileQueueStorage {
    root: PathBuf,
}

impl FileQueueStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl QueueStorage for FileQueueStorage {
    fn read(&self, key: &str) -> Result<Option<String>, SyncError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), SyncError> {
        fs::create_dir_all(&self.root)?;
        // Write-then-rename so a crash mid-write never leaves a truncated queue.
        let target = self.path_for(key);
        let staging = self.root.join(format!("{key}.json.tmp"));
        fs::write(&staging, value)?;
        fs::rename(&staging, &target)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryQueueStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStorage for MemoryQueueStorage {
    fn read(&self, key: &str) -> Result<Option<String>, SyncError> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
