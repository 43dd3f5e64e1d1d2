//! Configuration System
//!
//! Layered configuration for the controller and workers: built-in defaults, the
//! user's global file, workspace files, then `SCENESYNC__*` environment variables.
//! Validation reports every problem at once.

use crate::error::ApiError;
use crate::logging::LoggingConfig;
use crate::runtime::RuntimeSettings;
use crate::tree::{DiamondPolicy, TreeOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod facade;
mod merge;
mod paths;
mod sources;

pub use facade::ConfigLoader;
pub use paths::default_perf_store_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneSyncConfig {
    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub balance: BalanceConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Replica synchronization settings. Every replica of one scene must agree on these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Repair cycles attempted before a replica is marked sync_failed
    #[serde(default = "default_retry_limit")]
    pub repair_retry_limit: u32,

    #[serde(default)]
    pub diamond_policy: DiamondPolicy,

    #[serde(default = "default_separator")]
    pub identity_separator: String,
}

fn default_retry_limit() -> u32 {
    3
}

fn default_separator() -> String {
    "/".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            repair_retry_limit: default_retry_limit(),
            diamond_policy: DiamondPolicy::default(),
            identity_separator: default_separator(),
        }
    }
}

impl SyncConfig {
    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions {
            diamond_policy: self.diamond_policy,
            separator: self.identity_separator.clone(),
            ..TreeOptions::default()
        }
    }
}

/// Worker lifecycle and event loop timing, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_watchdog_tick")]
    pub watchdog_tick_ms: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

fn default_heartbeat_timeout() -> u64 {
    5000
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_watchdog_tick() -> u64 {
    250
}

fn default_poll_interval() -> u64 {
    20
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_handshake_timeout() -> u64 {
    2000
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            watchdog_tick_ms: default_watchdog_tick(),
            poll_interval_ms: default_poll_interval(),
            connect_attempts: default_connect_attempts(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl LifecycleConfig {
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings::from(self)
    }
}

/// Load balancer and performance model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Extra units rendered past each inner region edge
    #[serde(default = "default_overlap_margin")]
    pub overlap_margin: u64,

    /// Rolling window of k observations kept per worker
    #[serde(default = "default_perf_window")]
    pub perf_window: usize,

    /// Seconds per unit of work assumed for workers without history
    #[serde(default = "default_k")]
    pub default_k: f64,

    /// Seconds of setup assumed for workers without history
    #[serde(default)]
    pub default_setup: f64,

    /// Render engine name; performance history is kept per engine
    #[serde(default = "default_engine")]
    pub engine: String,
}

fn default_overlap_margin() -> u64 {
    2
}

fn default_perf_window() -> usize {
    25
}

fn default_k() -> f64 {
    1.0
}

fn default_engine() -> String {
    "default".to_string()
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            overlap_margin: default_overlap_margin(),
            perf_window: default_perf_window(),
            default_k: default_k(),
            default_setup: 0.0,
            engine: default_engine(),
        }
    }
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sled database holding per-worker performance history
    #[serde(default = "default_perf_store_path")]
    pub perf_store_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            perf_store_path: default_perf_store_path(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Sync(String),
    Lifecycle(String),
    Balance(String),
    Storage(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Sync(msg) => write!(f, "Sync: {}", msg),
            ValidationError::Lifecycle(msg) => write!(f, "Lifecycle: {}", msg),
            ValidationError::Balance(msg) => write!(f, "Balance: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl SceneSyncConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.sync.repair_retry_limit == 0 {
            errors.push(ValidationError::Sync(
                "repair_retry_limit must be at least 1".to_string(),
            ));
        }
        if self.sync.identity_separator.is_empty() {
            errors.push(ValidationError::Sync(
                "identity_separator cannot be empty".to_string(),
            ));
        }

        let lc = &self.lifecycle;
        if lc.poll_interval_ms == 0 {
            errors.push(ValidationError::Lifecycle(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if lc.connect_attempts == 0 {
            errors.push(ValidationError::Lifecycle(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        if lc.heartbeat_interval_ms >= lc.heartbeat_timeout_ms {
            errors.push(ValidationError::Lifecycle(format!(
                "heartbeat_interval_ms ({}) must be shorter than heartbeat_timeout_ms ({})",
                lc.heartbeat_interval_ms, lc.heartbeat_timeout_ms
            )));
        }
        if lc.watchdog_tick_ms == 0 || lc.watchdog_tick_ms > lc.heartbeat_timeout_ms {
            errors.push(ValidationError::Lifecycle(format!(
                "watchdog_tick_ms must be within 1..={}",
                lc.heartbeat_timeout_ms
            )));
        }

        if self.balance.perf_window == 0 {
            errors.push(ValidationError::Balance(
                "perf_window must be at least 1".to_string(),
            ));
        }
        if !(self.balance.default_k.is_finite() && self.balance.default_k > 0.0) {
            errors.push(ValidationError::Balance(format!(
                "default_k must be positive, got {}",
                self.balance.default_k
            )));
        }
        if !(self.balance.default_setup.is_finite() && self.balance.default_setup >= 0.0) {
            errors.push(ValidationError::Balance(format!(
                "default_setup cannot be negative, got {}",
                self.balance.default_setup
            )));
        }
        if self.balance.engine.trim().is_empty() {
            errors.push(ValidationError::Balance("engine cannot be empty".to_string()));
        }

        if self.storage.perf_store_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "perf_store_path cannot be empty".to_string(),
            ));
        }

        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold every problem into one `ApiError`.
    pub fn ensure_valid(&self) -> Result<(), ApiError> {
        self.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ApiError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })
    }
}
