use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use thiserror::Error;

use super::{unix_now, CacheKey, ResponseFile};

/// Worker slot currently materializing an entry. `None` means no writer.
pub type WorkerId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    NotFound,
    InProgress,
    Available,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("cache key not found")]
    KeyNotFound,
    #[error("invalid value for cache key or datafile")]
    InvalidEntry,
}

#[derive(Debug)]
struct CacheEntry {
    status: EntryStatus,
    worker: Option<WorkerId>,
    response: Option<ResponseFile>,
    atime: i64,
    ctime: i64,
}

/// Thread-safe index over every known digest. Three logical maps, each behind
/// its own reader-writer lock so hot status/atime lookups never contend with
/// writes to the other maps. Multi-map operations (`put`, `delete`) take all
/// three write locks in a fixed order: meta, store, dataref.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    meta: RwLock<HashMap<CacheKey, CacheEntry>>,
    store: RwLock<HashMap<CacheKey, PathBuf>>,
    dataref: RwLock<HashMap<PathBuf, CacheKey>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry with default metadata. Idempotent: rows that already
    /// exist are left untouched. Fails only on an empty key or datafile.
    pub fn put(&self, key: &CacheKey, datafile: &Path) -> Result<(), IndexError> {
        if key.is_empty() || datafile.as_os_str().is_empty() {
            return Err(IndexError::InvalidEntry);
        }

        let mut meta = self.meta.write();
        let mut store = self.store.write();
        let mut dataref = self.dataref.write();

        meta.entry(key.clone()).or_insert_with(|| {
            let now = unix_now();
            CacheEntry {
                status: EntryStatus::NotFound,
                worker: None,
                response: None,
                atime: now,
                ctime: now,
            }
        });
        store
            .entry(key.clone())
            .or_insert_with(|| datafile.to_path_buf());
        dataref
            .entry(datafile.to_path_buf())
            .or_insert_with(|| key.clone());
        Ok(())
    }

    /// Remove all three rows for a digest. Safe to call for absent keys.
    pub fn delete(&self, key: &CacheKey) {
        let mut meta = self.meta.write();
        let mut store = self.store.write();
        let mut dataref = self.dataref.write();

        if let Some(df) = store.get(key) {
            dataref.remove(df);
        }
        store.remove(key);
        meta.remove(key);
    }

    pub fn get_status(&self, key: &CacheKey) -> EntryStatus {
        self.meta
            .read()
            .get(key)
            .map(|e| e.status)
            .unwrap_or(EntryStatus::NotFound)
    }

    pub fn set_status(&self, key: &CacheKey, status: EntryStatus) -> Result<(), IndexError> {
        match self.meta.write().get_mut(key) {
            Some(entry) => {
                entry.status = status;
                Ok(())
            }
            None => Err(IndexError::KeyNotFound),
        }
    }

    pub fn get_worker(&self, key: &CacheKey) -> Option<WorkerId> {
        self.meta.read().get(key).and_then(|e| e.worker)
    }

    /// Assign the writer slot. With `force` the assignment is unconditional;
    /// without it the write only happens when no writer is currently set, and
    /// the call still succeeds when refused — callers detect the outcome by
    /// re-reading the slot. This is the claim primitive that elects a single
    /// fetcher per digest.
    pub fn set_worker(
        &self,
        key: &CacheKey,
        worker: Option<WorkerId>,
        force: bool,
    ) -> Result<(), IndexError> {
        match self.meta.write().get_mut(key) {
            Some(entry) => {
                if force || entry.worker.is_none() {
                    entry.worker = worker;
                }
                Ok(())
            }
            None => Err(IndexError::KeyNotFound),
        }
    }

    pub fn get_response_file(&self, key: &CacheKey) -> Result<ResponseFile, IndexError> {
        self.meta
            .read()
            .get(key)
            .and_then(|e| e.response.clone())
            .ok_or(IndexError::KeyNotFound)
    }

    pub fn set_response_file(&self, key: &CacheKey, rf: &ResponseFile) -> Result<(), IndexError> {
        match self.meta.write().get_mut(key) {
            Some(entry) => {
                entry.response = Some(rf.clone());
                Ok(())
            }
            None => Err(IndexError::KeyNotFound),
        }
    }

    pub fn get_atime(&self, key: &CacheKey) -> Result<i64, IndexError> {
        self.meta
            .read()
            .get(key)
            .map(|e| e.atime)
            .ok_or(IndexError::KeyNotFound)
    }

    /// Stamp the last-access time with the current clock.
    pub fn set_atime(&self, key: &CacheKey) -> Result<(), IndexError> {
        match self.meta.write().get_mut(key) {
            Some(entry) => {
                entry.atime = unix_now();
                Ok(())
            }
            None => Err(IndexError::KeyNotFound),
        }
    }

    pub fn get_ctime(&self, key: &CacheKey) -> Result<i64, IndexError> {
        self.meta
            .read()
            .get(key)
            .map(|e| e.ctime)
            .ok_or(IndexError::KeyNotFound)
    }

    pub fn get_datafile(&self, key: &CacheKey) -> Result<PathBuf, IndexError> {
        self.store
            .read()
            .get(key)
            .cloned()
            .ok_or(IndexError::KeyNotFound)
    }

    pub fn get_data_ref(&self, datafile: &Path) -> Option<CacheKey> {
        self.dataref.read().get(datafile).cloned()
    }

    pub fn list_cache_keys(&self) -> Vec<CacheKey> {
        self.store.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn set_times(&self, key: &CacheKey, atime: i64, ctime: i64) {
        if let Some(entry) = self.meta.write().get_mut(key) {
            entry.atime = atime;
            entry.ctime = ctime;
        }
    }
}
