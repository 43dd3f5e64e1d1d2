//! Controller and worker event loops
//!
//! Each process runs one single-threaded loop that polls its inbound channels
//! with a short timeout. Tree mutation and partitioning happen only on that
//! thread; the watchdog is the one auxiliary thread, and it talks to the loop
//! through its own channel. Every handler runs inside the crash barrier.

pub mod barrier;
pub mod cluster;
pub mod controller;
pub mod render;
pub mod transport;
pub mod worker;

pub use barrier::guarded;
pub use cluster::{LocalCluster, WorkerSetup, CONTROLLER_NAME};
pub use controller::{Controller, ControllerCommand, SceneEdit};
pub use render::{RenderBackend, RenderReport, SimulatedRenderer};
pub use transport::{ChannelHub, ChannelTransport, ControlMessage, Envelope, Transport};
pub use worker::Worker;

use crate::config::LifecycleConfig;
use std::time::Duration;

/// Upper bound on envelopes handled per loop iteration before other channels get a turn.
pub(crate) const MAX_BATCH: usize = 64;

/// Finished and cancelled jobs the controller keeps around for inspection.
pub const JOB_HISTORY: usize = 32;

/// Timing knobs shared by both loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub connect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub watchdog_tick: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from(&LifecycleConfig::default())
    }
}

impl From<&LifecycleConfig> for RuntimeSettings {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            connect_attempts: config.connect_attempts.max(1),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
            watchdog_tick: Duration::from_millis(config.watchdog_tick_ms),
        }
    }
}
