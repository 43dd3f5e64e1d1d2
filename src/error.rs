//! Error types for the scenesync replica and scheduling engine.

use crate::types::{Identity, WorkerId};
use thiserror::Error;

/// Structural errors raised by the hash tree.
///
/// Fatal to the affected node only; the tree stays usable.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Stale node handle: {0}")]
    StaleNode(u64),

    #[error("Identity collision unresolved for {0} after {1} suffixes")]
    IdentityCollision(Identity, u32),

    #[error("Malformed edge from {parent}: {reason}")]
    MalformedEdge { parent: Identity, reason: String },

    #[error("Edge from {parent} to {child} would close a cycle")]
    Cycle { parent: Identity, child: Identity },

    #[error("Tree has no root; build it first")]
    Empty,
}

/// Replica synchronization errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Replica still diverged after {attempts} repair attempts (local {local:016x}, expected {expected:016x})")]
    Divergence {
        attempts: u32,
        local: u64,
        expected: u64,
    },

    #[error("Unexpected message in state {state}: {message}")]
    UnexpectedMessage { state: String, message: String },

    #[error("Wire codec error: {0}")]
    Codec(String),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Load balancer errors.
#[derive(Debug, Error, PartialEq)]
pub enum BalanceError {
    #[error("No workers available for partitioning")]
    NoWorkersAvailable,

    #[error("Workload of {units} units cannot give {workers} workers one unit each")]
    WorkloadTooSmall { units: u64, workers: usize },

    #[error("Worker {worker}: per-unit cost must be positive and finite, got {k}")]
    InvalidCoefficient { worker: WorkerId, k: f64 },

    #[error("Worker {worker}: setup time must be finite and non-negative, got {setup}")]
    InvalidSetup { worker: WorkerId, setup: f64 },

    #[error("Worker {worker}: manual fraction must be within (0, 1], got {fraction}")]
    InvalidManualFraction { worker: WorkerId, fraction: f64 },

    #[error("Manual fractions sum to {total}, which exceeds the whole workload")]
    ManualOverCommit { total: f64 },
}

/// Worker lifecycle errors.
#[derive(Debug, Error, PartialEq)]
pub enum LifecycleError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Worker {worker}: invalid transition {from} -> {to}")]
    InvalidTransition {
        worker: WorkerId,
        from: String,
        to: String,
    },

    #[error("Worker {worker}: connection failed after {attempts} attempts")]
    ConnectFailed { worker: WorkerId, attempts: u32 },

    #[error("Worker {worker}: {operation} timed out")]
    Timeout { worker: WorkerId, operation: String },
}

/// Render job scheduling errors.
#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("Unknown job: {0}")]
    UnknownJob(u64),

    #[error("Job {job} is {state}, expected {expected}")]
    JobState {
        job: u64,
        state: String,
        expected: String,
    },

    #[error("Worker {worker} has no region in job {job}")]
    NotAssigned { job: u64, worker: WorkerId },

    #[error("Partitioning failed: {0}")]
    Balance(#[from] BalanceError),
}

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage codec error: {0}")]
    Codec(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Codec(err.to_string())
    }
}

/// Umbrella error returned by runtime handlers and the public API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Balance error: {0}")]
    Balance(#[from] BalanceError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Handler panicked: {0}")]
    Panic(String),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}

/// Recognized error kinds at the event-loop boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Structural,
    Divergence,
    TransientNetwork,
    /// Peers disagree on shape: attribute presence, or a sync payload one side cannot decode.
    Schema,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Structural => "structural",
            ErrorKind::Divergence => "divergence",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Schema => "schema",
            ErrorKind::Other => "other",
        }
    }
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Tree(_) => ErrorKind::Structural,
            ApiError::Sync(SyncError::Tree(_)) => ErrorKind::Structural,
            ApiError::Sync(SyncError::Divergence { .. }) => ErrorKind::Divergence,
            ApiError::Sync(SyncError::Codec(_)) => ErrorKind::Schema,
            ApiError::Lifecycle(LifecycleError::ConnectFailed { .. })
            | ApiError::Lifecycle(LifecycleError::Timeout { .. })
            | ApiError::Transport(_) => ErrorKind::TransientNetwork,
            _ => ErrorKind::Other,
        }
    }
}
