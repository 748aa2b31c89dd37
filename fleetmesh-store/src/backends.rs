//! Pluggable storage backends for the replicated task store (spec §4.F).

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend I/O error: {0}")]
    Io(String),
}

/// The ordered key→value mapping consumed by `TaskStore`. Keys must iterate
/// in lexicographic order so `range(prefix)` (spec §4.F) is well-defined.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: String, value: Vec<u8>) -> Result<(), BackendError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;
    fn range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BackendError>;
    fn remove(&self, key: &str) -> Result<(), BackendError>;
}

/// Default volatile backend (spec §4.F "the reference uses volatile
/// in-memory backing"). A `BTreeMap` is used rather than the teacher's
/// `HashMap`/`DashMap` caches because this store specifically needs ordered
/// iteration for `range(prefix)`.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, key: String, value: Vec<u8>) -> Result<(), BackendError> {
        self.data.lock().insert(key, value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BackendError> {
        Ok(self
            .data
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.data.lock().remove(key);
        Ok(())
    }
}

/// File-backed alternative, satisfying spec §4.F's "implementers SHOULD
/// provide a file-backed alternative behind the same interface". `sled`
/// already orders keys lexicographically by byte value, which matches this
/// store's requirement directly.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let db = sled::open(path).map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledBackend {
    fn put(&self, key: String, value: Vec<u8>) -> Result<(), BackendError> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self
            .db
            .get(key.as_bytes())
            .map_err(|e| BackendError::Io(e.to_string()))?
            .map(|v| v.to_vec()))
    }

    fn range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BackendError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (k, v) = item.map_err(|e| BackendError::Io(e.to_string()))?;
            let key = String::from_utf8_lossy(&k).to_string();
            out.push((key, v.to_vec()));
        }
        Ok(out)
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(())
    }
}
