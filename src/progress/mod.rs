//! Progress observability primitives.
//!
//! Sync, lifecycle and scheduling code emits diagnostic events on a [`ProgressBus`];
//! whoever holds the receiving end decides what to do with them (print, persist, drop).

pub mod bus;
pub mod event;

pub use bus::ProgressBus;
pub use event::{
    DispatchData,
    FaultData,
    JobData,
    LoopErrorData,
    PartitionData,
    ProgressEvent,
    RepairData,
    WorkerStateData,
};
