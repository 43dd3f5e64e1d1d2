//! Performance Store
//!
//! Durable key/value storage for per-worker performance history, keyed by
//! logical session, render engine and worker.

pub mod persistence;

pub use persistence::SledPerfStore;

use crate::balance::model::WorkerPerformance;
use crate::error::StorageError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;

/// `perf/{session}/{engine}/{worker}`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PerfKey {
    pub session: String,
    pub engine: String,
    pub worker: String,
}

impl PerfKey {
    pub fn new(session: &str, engine: &str, worker: &str) -> Self {
        Self {
            session: session.to_string(),
            engine: engine.to_string(),
            worker: worker.to_string(),
        }
    }

    /// Prefix shared by every worker of one session and engine.
    pub fn prefix(session: &str, engine: &str) -> String {
        format!("perf/{}/{}/", session, engine)
    }
}

impl fmt::Display for PerfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "perf/{}/{}/{}", self.session, self.engine, self.worker)
    }
}

/// Performance store interface
pub trait PerfStore: Send + Sync {
    fn get(&self, key: &PerfKey) -> Result<Option<WorkerPerformance>, StorageError>;
    fn set(&self, key: &PerfKey, value: &WorkerPerformance) -> Result<(), StorageError>;

    /// Workers with stored history for one session and engine.
    fn workers(&self, session: &str, engine: &str) -> Result<Vec<String>, StorageError>;
}

/// In-process store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryPerfStore {
    entries: RwLock<BTreeMap<String, WorkerPerformance>>,
}

impl MemoryPerfStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl PerfStore for MemoryPerfStore {
    fn get(&self, key: &PerfKey) -> Result<Option<WorkerPerformance>, StorageError> {
        Ok(self.entries.read().get(&key.to_string()).cloned())
    }

    fn set(&self, key: &PerfKey, value: &WorkerPerformance) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn workers(&self, session: &str, engine: &str) -> Result<Vec<String>, StorageError> {
        let prefix = PerfKey::prefix(session, engine);
        Ok(self
            .entries
            .read()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }
}
