//! Persistence layer for the performance store

use crate::balance::model::WorkerPerformance;
use crate::error::StorageError;
use crate::store::{PerfKey, PerfStore};
use std::path::Path;

/// Sled-based implementation of PerfStore
pub struct SledPerfStore {
    db: sled::Db,
}

impl SledPerfStore {
    /// Open (or create) a store at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to open sled database: {}", e),
            ))
        })?;
        Ok(Self { db })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl PerfStore for SledPerfStore {
    fn get(&self, key: &PerfKey) -> Result<Option<WorkerPerformance>, StorageError> {
        match self.db.get(key.to_string().as_bytes())? {
            Some(value) => {
                let perf: WorkerPerformance = bincode::deserialize(&value).map_err(|e| {
                    StorageError::Codec(format!("Failed to deserialize performance record: {}", e))
                })?;
                Ok(Some(perf))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &PerfKey, value: &WorkerPerformance) -> Result<(), StorageError> {
        let bytes = bincode::serialize(value).map_err(|e| {
            StorageError::Codec(format!("Failed to serialize performance record: {}", e))
        })?;
        self.db.insert(key.to_string().as_bytes(), bytes)?;
        Ok(())
    }

    fn workers(&self, session: &str, engine: &str) -> Result<Vec<String>, StorageError> {
        let prefix = PerfKey::prefix(session, engine);
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some(worker) = key.strip_prefix(&prefix) {
                out.push(worker.to_string());
            }
        }
        Ok(out)
    }
}
