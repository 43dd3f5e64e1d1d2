//! Worker registry and lifecycle state machine
//!
//! Worker state changes only in response to the worker's own status messages,
//! with two exceptions: the watchdog marks a silent worker `Unresponsive`, and
//! the local worker is always `Synced`. Each entry sits behind its own mutex
//! because the event loop and the watchdog thread both write status.

use crate::error::LifecycleError;
use crate::progress::{ProgressBus, WorkerStateData};
use crate::types::WorkerId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connection and render state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Ready,
    Connecting,
    Syncing,
    Synced,
    Rendering,
    SyncFailed,
    Repairing,
    Unresponsive,
    Exited,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Ready => "ready",
            WorkerState::Connecting => "connecting",
            WorkerState::Syncing => "syncing",
            WorkerState::Synced => "synced",
            WorkerState::Rendering => "rendering",
            WorkerState::SyncFailed => "sync_failed",
            WorkerState::Repairing => "repairing",
            WorkerState::Unresponsive => "unresponsive",
            WorkerState::Exited => "exited",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == WorkerState::Exited
    }

    /// Whether a status message may move a worker from `self` to `to`.
    pub fn can_transition(self, to: WorkerState) -> bool {
        use WorkerState::*;
        if self == to {
            return !self.is_terminal();
        }
        match (self, to) {
            (Exited, _) => false,
            (_, Exited) | (_, Unresponsive) => true,
            (Ready, Connecting) => true,
            (Connecting, Syncing) => true,
            (Syncing, Synced) | (Syncing, SyncFailed) | (Syncing, Repairing) => true,
            (Synced, Rendering) | (Synced, Syncing) | (Synced, Repairing) => true,
            (Rendering, Synced) => true,
            (SyncFailed, Repairing) | (SyncFailed, Syncing) => true,
            (Repairing, Synced) | (Repairing, SyncFailed) => true,
            // A worker that speaks again reports whatever it is doing now.
            (Unresponsive, Ready) => false,
            (Unresponsive, _) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub id: WorkerId,
    pub state: WorkerState,
    pub last_seen: Instant,
    pub enabled: bool,
    /// In-process worker; never leaves `Synced`.
    pub local: bool,
    pub manual_fraction: Option<f64>,
}

/// Watchdog notifications delivered to the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    Unresponsive(WorkerId),
}

/// Process-wide worker table.
#[derive(Debug)]
pub struct NodeRegistry {
    workers: RwLock<BTreeMap<WorkerId, Arc<Mutex<WorkerEntry>>>>,
    heartbeat_timeout: Duration,
    progress: ProgressBus,
}

impl NodeRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            workers: RwLock::new(BTreeMap::new()),
            heartbeat_timeout,
            progress: ProgressBus::detached(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBus) -> Self {
        self.progress = progress;
        self
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Add a remote worker in `Ready`.
    pub fn register(&self, id: impl Into<WorkerId>) -> WorkerState {
        self.insert(id.into(), false)
    }

    /// Add the in-process worker, which is always `Synced`.
    pub fn register_local(&self, id: impl Into<WorkerId>) -> WorkerState {
        self.insert(id.into(), true)
    }

    fn insert(&self, id: WorkerId, local: bool) -> WorkerState {
        let state = if local { WorkerState::Synced } else { WorkerState::Ready };
        let entry = WorkerEntry {
            id: id.clone(),
            state,
            last_seen: Instant::now(),
            enabled: true,
            local,
            manual_fraction: None,
        };
        info!(worker = %id, local, "Worker registered");
        self.workers.write().insert(id, Arc::new(Mutex::new(entry)));
        state
    }

    pub fn entry(&self, id: &str) -> Result<Arc<Mutex<WorkerEntry>>, LifecycleError> {
        self.workers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownWorker(id.to_string()))
    }

    /// Apply a status message from the worker itself. Returns the previous state.
    pub fn apply_status(&self, id: &str, to: WorkerState) -> Result<WorkerState, LifecycleError> {
        if to == WorkerState::Exited {
            return self.remove(id);
        }
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        entry.last_seen = Instant::now();
        let from = entry.state;
        if entry.local {
            return Ok(from);
        }
        if !from.can_transition(to) {
            return Err(LifecycleError::InvalidTransition {
                worker: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        entry.state = to;
        drop(entry);
        if from != to {
            self.announce(id, from, to);
        }
        Ok(from)
    }

    /// Refresh the liveness deadline without changing state.
    pub fn heartbeat(&self, id: &str) -> Result<(), LifecycleError> {
        self.entry(id)?.lock().last_seen = Instant::now();
        Ok(())
    }

    /// Mark every worker silent for longer than the timeout as `Unresponsive`.
    pub fn expire_stale(&self, now: Instant) -> Vec<WorkerId> {
        let entries: Vec<Arc<Mutex<WorkerEntry>>> = self.workers.read().values().cloned().collect();
        let mut expired = Vec::new();
        for entry in entries {
            let mut entry = entry.lock();
            if entry.local || matches!(entry.state, WorkerState::Unresponsive | WorkerState::Exited) {
                continue;
            }
            if now.saturating_duration_since(entry.last_seen) > self.heartbeat_timeout {
                let from = entry.state;
                entry.state = WorkerState::Unresponsive;
                let id = entry.id.clone();
                drop(entry);
                warn!(worker = %id, from = %from, "Worker missed heartbeat deadline");
                self.announce(&id, from, WorkerState::Unresponsive);
                expired.push(id);
            }
        }
        expired
    }

    /// Remove a worker for good. Returns its last state.
    pub fn remove(&self, id: &str) -> Result<WorkerState, LifecycleError> {
        let entry = self
            .workers
            .write()
            .remove(id)
            .ok_or_else(|| LifecycleError::UnknownWorker(id.to_string()))?;
        let from = entry.lock().state;
        self.announce(id, from, WorkerState::Exited);
        Ok(from)
    }

    pub fn state(&self, id: &str) -> Option<WorkerState> {
        self.workers.read().get(id).map(|e| e.lock().state)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), LifecycleError> {
        self.entry(id)?.lock().enabled = enabled;
        Ok(())
    }

    pub fn set_manual_fraction(&self, id: &str, fraction: Option<f64>) -> Result<(), LifecycleError> {
        self.entry(id)?.lock().manual_fraction = fraction;
        Ok(())
    }

    /// Enabled workers currently `Synced`, in id order. Only these may receive work.
    pub fn dispatchable(&self) -> Vec<WorkerEntry> {
        self.workers
            .read()
            .values()
            .map(|e| e.lock().clone())
            .filter(|e| e.enabled && e.state == WorkerState::Synced)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(WorkerId, WorkerState)> {
        self.workers
            .read()
            .iter()
            .map(|(id, e)| (id.clone(), e.lock().state))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    fn announce(&self, id: &str, from: WorkerState, to: WorkerState) {
        debug!(worker = %id, from = %from, to = %to, "Worker state changed");
        self.progress.emit_best_effort(
            "worker_state",
            &WorkerStateData {
                worker: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            },
        );
    }
}

/// Background thread that expires silent workers on a fixed tick.
pub struct Watchdog {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(registry: Arc<NodeRegistry>, tick: Duration, events: Sender<WatchdogEvent>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("scenesync-watchdog".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    for id in registry.expire_stale(Instant::now()) {
                        if events.send(WatchdogEvent::Unresponsive(id)).is_err() {
                            return;
                        }
                    }
                }
            });
        let handle = match handle {
            Ok(h) => Some(h),
            Err(err) => {
                warn!(error = %err, "Failed to start watchdog thread");
                None
            }
        };
        Self { stop, handle }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
