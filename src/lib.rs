//! scenesync: Scene Replica Synchronization and Render Load Balancing
//!
//! Keeps worker replicas of a 3D scene consistent with a controller through a
//! content-addressed hash tree, repairs divergence with minimal traffic, and
//! splits render work across workers by their measured speed.

pub mod balance;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod progress;
pub mod registry;
pub mod runtime;
pub mod scene;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod tree;
pub mod types;

pub use error::{ApiError, ErrorKind};
pub use types::{AttrValue, Hash, Identity, WorkerId};
