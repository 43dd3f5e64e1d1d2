//! Adaptive load balancing
//!
//! Partitions a fixed workload across enabled, synced workers in proportion to
//! their measured throughput, and keeps the per-worker performance history that
//! feeds the next partition.

pub mod model;
pub mod partition;

pub use model::{PerformanceModel, WorkerPerformance};
pub use partition::{Allocation, LoadBalancer, Partition, WorkerProfile, Workload};
