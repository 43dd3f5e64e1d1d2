//! Replica synchronization
//!
//! Wire types plus the two halves of the divergence-repair protocol.

pub mod coordinator;
pub mod wire;

pub use coordinator::{apply_snapshot, ReplicaStatus, ReplicaSync, RoundTrips, SyncAuthority, SyncFault};
pub use wire::{
    plan_repairs, Announcement, AttributeManifest, ChangeRecord, ManifestEntry, RepairCommand, Snapshot,
    SnapshotNode, SyncMessage, TopManifest,
};
