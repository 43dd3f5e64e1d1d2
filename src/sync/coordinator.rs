//! Divergence detection and repair between a controller tree and a replica tree
//!
//! The controller side ([`SyncAuthority`]) announces batches and answers manifest
//! and snapshot requests. The replica side ([`ReplicaSync`]) applies announced
//! changes through its own host, compares top hashes, and on mismatch walks down:
//! top-level manifest, then attribute manifests for nodes whose own hash differs,
//! then repairs. Each repair cycle re-checks the top hash; the cycle count is
//! bounded and exhaustion leaves the replica in `SyncFailed` until a full resync.

use crate::error::{ErrorKind, SyncError, TreeError};
use crate::progress::{FaultData, ProgressBus, RepairData};
use crate::sync::wire::{
    plan_repairs, Announcement, AttributeManifest, RepairCommand, Snapshot, SyncMessage,
    TopManifest,
};
use crate::tree::{hasher, HashTree, NodeKey, RuleProvider, SceneHost, TreeOptions};
use crate::types::{Hash, Identity};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

/// Controller half of the protocol. Owns the authoritative tree.
#[derive(Debug)]
pub struct SyncAuthority<O> {
    tree: HashTree<O>,
    /// Top hash replicas were last told about.
    announced: Hash,
    progress: ProgressBus,
}

impl<O: Clone> SyncAuthority<O> {
    pub fn new(tree: HashTree<O>) -> Self {
        let announced = tree.top_hash();
        Self {
            tree,
            announced,
            progress: ProgressBus::detached(),
        }
    }

    pub fn build<R>(rules: &R, root: O, options: TreeOptions) -> Result<Self, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        Ok(Self::new(HashTree::build(rules, root, options)?))
    }

    pub fn with_progress(mut self, progress: ProgressBus) -> Self {
        self.progress = progress;
        self
    }

    pub fn tree(&self) -> &HashTree<O> {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut HashTree<O> {
        &mut self.tree
    }

    pub fn top_hash(&self) -> Hash {
        self.tree.top_hash()
    }

    /// Rescan host objects that were just mutated locally.
    ///
    /// Objects the tree has never seen are skipped; rescanning their parent picks them up.
    pub fn touch<R>(&mut self, rules: &R, objects: &[O]) -> Result<Hash, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let keys: Vec<NodeKey> = objects
            .iter()
            .filter_map(|o| {
                let key = self.tree.lookup_ref(rules.volatile_ref(o));
                if key.is_none() {
                    debug!("Touched object is not in the tree yet");
                }
                key
            })
            .collect();
        self.tree.rescan_many(rules, &keys)
    }

    /// Follow a host-side undo; announce afterwards like any other edit.
    pub fn undo<R>(&mut self, rules: &R) -> Result<Option<Hash>, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        self.tree.undo(rules)
    }

    pub fn redo<R>(&mut self, rules: &R) -> Result<Option<Hash>, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        self.tree.redo(rules)
    }

    /// Drain the pending queue into an announcement
    ///
    /// `None` only when there are no records and the top hash is the one already
    /// announced. Structural edits (objects added or dropped) carry no records; they
    /// are announced by top hash alone and replicas reach them through repair.
    pub fn announce(&mut self) -> Option<Announcement> {
        let batch = self.tree.take_batch();
        if batch.is_empty() && batch.top_hash == self.announced {
            return None;
        }
        self.announced = batch.top_hash;
        let announcement = Announcement::from(batch);
        info!(
            top_hash = %hasher::display(announcement.top_hash),
            changes = announcement.changes.len(),
            renames = announcement.renames.len(),
            "Announcing batch"
        );
        self.progress.emit_best_effort(
            "announcement",
            &serde_json::json!({
                "top_hash": hasher::display(announcement.top_hash),
                "changes": announcement.changes.len(),
                "renames": announcement.renames.len(),
            }),
        );
        Some(announcement)
    }

    /// Answer a replica's request.
    pub fn respond<R>(&self, rules: &R, request: &SyncMessage) -> Result<SyncMessage, SyncError>
    where
        R: RuleProvider<Object = O>,
    {
        match request {
            SyncMessage::RequestTopManifest => Ok(SyncMessage::TopManifest(TopManifest::capture(&self.tree))),
            SyncMessage::RequestAttributes(identities) => {
                let manifests = identities
                    .iter()
                    .filter_map(|id| {
                        let manifest = AttributeManifest::capture(&self.tree, rules, id);
                        if manifest.is_none() {
                            debug!(identity = %id, "Attribute manifest requested for unknown identity");
                        }
                        manifest
                    })
                    .collect();
                Ok(SyncMessage::Attributes(manifests))
            }
            SyncMessage::RequestSnapshot => {
                info!(nodes = self.tree.len(), "Sending full snapshot");
                Ok(SyncMessage::Snapshot(Snapshot::capture(&self.tree, rules)))
            }
            other => Err(SyncError::UnexpectedMessage {
                state: "authority".to_string(),
                message: other.name().to_string(),
            }),
        }
    }
}

/// Replica sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    Synced,
    Repairing,
    SyncFailed,
}

impl ReplicaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicaStatus::Synced => "synced",
            ReplicaStatus::Repairing => "repairing",
            ReplicaStatus::SyncFailed => "sync_failed",
        }
    }
}

/// Non-fatal problem found while comparing manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFault {
    /// Identity known to one side only. `on_replica` is true when the replica lacks it.
    MissingDatablock { identity: Identity, on_replica: bool },
    /// Attribute present on one side only.
    Schema { identity: Identity, attribute: String },
}

impl SyncFault {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncFault::MissingDatablock { .. } => ErrorKind::Structural,
            SyncFault::Schema { .. } => ErrorKind::Schema,
        }
    }

    pub fn identity(&self) -> &Identity {
        match self {
            SyncFault::MissingDatablock { identity, .. } | SyncFault::Schema { identity, .. } => identity,
        }
    }
}

/// Requests issued by a replica, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundTrips {
    pub top_manifest: u32,
    pub attributes: u32,
    pub snapshot: u32,
}

/// Replica half of the protocol. Owns the replica's tree; the host is passed per call.
#[derive(Debug)]
pub struct ReplicaSync<O> {
    tree: HashTree<O>,
    status: ReplicaStatus,
    expected: Hash,
    attempts: u32,
    retry_limit: u32,
    faults: Vec<SyncFault>,
    round_trips: RoundTrips,
    /// A snapshot was requested and has not arrived yet.
    resync_pending: bool,
    progress: ProgressBus,
}

impl<O: Clone> ReplicaSync<O> {
    pub fn new(tree: HashTree<O>, retry_limit: u32) -> Self {
        let expected = tree.top_hash();
        Self {
            tree,
            status: ReplicaStatus::Synced,
            expected,
            attempts: 0,
            retry_limit: retry_limit.max(1),
            faults: Vec::new(),
            round_trips: RoundTrips::default(),
            resync_pending: false,
            progress: ProgressBus::detached(),
        }
    }

    pub fn build<H>(host: &H, options: TreeOptions, retry_limit: u32) -> Result<Self, TreeError>
    where
        H: SceneHost<Object = O>,
    {
        let tree = HashTree::build(host, host.root(), options)?;
        Ok(Self::new(tree, retry_limit))
    }

    pub fn with_progress(mut self, progress: ProgressBus) -> Self {
        self.progress = progress;
        self
    }

    pub fn tree(&self) -> &HashTree<O> {
        &self.tree
    }

    pub fn status(&self) -> ReplicaStatus {
        self.status
    }

    pub fn top_hash(&self) -> Hash {
        self.tree.top_hash()
    }

    /// Top hash the replica is trying to reach.
    pub fn expected(&self) -> Hash {
        self.expected
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn round_trips(&self) -> RoundTrips {
        self.round_trips
    }

    pub fn faults(&self) -> &[SyncFault] {
        &self.faults
    }

    pub fn take_faults(&mut self) -> Vec<SyncFault> {
        std::mem::take(&mut self.faults)
    }

    /// Process one inbound message; returns the request to send back, if any.
    ///
    /// An `Err(SyncError::Divergence)` means the retry budget is spent and the
    /// replica is now `SyncFailed`.
    pub fn handle<H>(&mut self, host: &mut H, message: SyncMessage) -> Result<Option<SyncMessage>, SyncError>
    where
        H: SceneHost<Object = O>,
    {
        match message {
            SyncMessage::Announce(announcement) => self.on_announcement(host, announcement),
            SyncMessage::TopManifest(manifest) if self.status == ReplicaStatus::Repairing => {
                self.on_top_manifest(manifest)
            }
            SyncMessage::Attributes(manifests) if self.status == ReplicaStatus::Repairing => {
                self.on_attributes(host, manifests)
            }
            SyncMessage::Repair(commands) => {
                if self.status == ReplicaStatus::Synced {
                    self.status = ReplicaStatus::Repairing;
                }
                self.apply_repairs(host, &commands)?;
                self.attempts += 1;
                self.finish_attempt()
            }
            SyncMessage::Snapshot(snapshot) => self.on_snapshot(host, snapshot),
            other => Err(SyncError::UnexpectedMessage {
                state: self.status.as_str().to_string(),
                message: other.name().to_string(),
            }),
        }
    }

    /// Operator-triggered full resync: ask for a snapshot.
    pub fn request_full_resync(&mut self) -> SyncMessage {
        info!(top_hash = %hasher::display(self.top_hash()), "Requesting full resync");
        self.status = ReplicaStatus::Repairing;
        self.resync_pending = true;
        self.round_trips.snapshot += 1;
        SyncMessage::RequestSnapshot
    }

    #[instrument(skip_all, fields(top_hash = %hasher::display(announcement.top_hash)))]
    fn on_announcement<H>(&mut self, host: &mut H, announcement: Announcement) -> Result<Option<SyncMessage>, SyncError>
    where
        H: SceneHost<Object = O>,
    {
        for rename in &announcement.renames {
            if self.tree.lookup(&rename.new).is_some() {
                continue;
            }
            let Some(key) = self.tree.lookup(&rename.old) else {
                self.record_fault(SyncFault::MissingDatablock {
                    identity: rename.old.clone(),
                    on_replica: true,
                });
                continue;
            };
            let object = self.object(key)?;
            host.rename(&object, &rename.stable_key);
            self.tree.rescan(&*host, key)?;
        }

        let mut touched = Vec::with_capacity(announcement.changes.len());
        for change in &announcement.changes {
            let Some(key) = self.tree.lookup(&change.identity) else {
                self.record_fault(SyncFault::MissingDatablock {
                    identity: change.identity.clone(),
                    on_replica: true,
                });
                continue;
            };
            let object = self.object(key)?;
            match &change.new_value {
                Some(value) => host.set_attribute(&object, &change.attribute, value.clone()),
                None => host.remove_attribute(&object, &change.attribute),
            }
            touched.push(key);
        }
        self.tree.rescan_many(&*host, &touched)?;
        self.tree.discard_pending();

        self.expected = announcement.top_hash;
        if self.tree.top_hash() == self.expected {
            self.mark_synced();
            return Ok(None);
        }
        if self.status == ReplicaStatus::SyncFailed || self.resync_pending {
            debug!("Replica awaiting full resync; announcement applied without repair");
            return Ok(None);
        }

        self.status = ReplicaStatus::Repairing;
        self.attempts = 0;
        warn!(
            local = %hasher::display(self.tree.top_hash()),
            expected = %hasher::display(self.expected),
            "Top hash mismatch, starting repair"
        );
        self.progress.emit_best_effort("repair_started", &self.repair_data(None));
        self.round_trips.top_manifest += 1;
        Ok(Some(SyncMessage::RequestTopManifest))
    }

    fn on_top_manifest(&mut self, remote: TopManifest) -> Result<Option<SyncMessage>, SyncError> {
        self.expected = remote.top_hash;
        if self.tree.top_hash() == self.expected {
            self.mark_synced();
            return Ok(None);
        }

        let local = TopManifest::capture(&self.tree);
        let mut flagged = Vec::new();
        let mut faults = Vec::new();
        for (identity, entry) in &remote.entries {
            match local.entries.get(identity) {
                None => faults.push(SyncFault::MissingDatablock {
                    identity: identity.clone(),
                    on_replica: true,
                }),
                Some(mine) if mine.own_hash != entry.own_hash => flagged.push(identity.clone()),
                Some(mine) if mine.aggregate_hash != entry.aggregate_hash => {
                    debug!(identity = %identity, "Divergence lies deeper in this subtree");
                }
                Some(_) => {}
            }
        }
        for identity in local.entries.keys() {
            if !remote.entries.contains_key(identity) {
                faults.push(SyncFault::MissingDatablock {
                    identity: identity.clone(),
                    on_replica: false,
                });
            }
        }
        for fault in faults {
            self.record_fault(fault);
        }

        if flagged.is_empty() {
            // Nothing attribute-level left to repair.
            return self.fail();
        }
        debug!(flagged = flagged.len(), "Requesting attribute manifests");
        self.round_trips.attributes += 1;
        Ok(Some(SyncMessage::RequestAttributes(flagged)))
    }

    fn on_attributes<H>(
        &mut self,
        host: &mut H,
        manifests: Vec<AttributeManifest>,
    ) -> Result<Option<SyncMessage>, SyncError>
    where
        H: SceneHost<Object = O>,
    {
        let mut commands = Vec::new();
        for manifest in &manifests {
            match self.tree.get_by_identity(&manifest.identity) {
                Some(node) => commands.extend(plan_repairs(&node.attribute_hashes, manifest)),
                None => self.record_fault(SyncFault::MissingDatablock {
                    identity: manifest.identity.clone(),
                    on_replica: true,
                }),
            }
        }
        self.apply_repairs(host, &commands)?;
        self.attempts += 1;
        self.finish_attempt()
    }

    fn on_snapshot<H>(&mut self, host: &mut H, snapshot: Snapshot) -> Result<Option<SyncMessage>, SyncError>
    where
        H: SceneHost<Object = O>,
    {
        self.resync_pending = false;
        apply_snapshot(host, &snapshot)?;
        let root = host.root();
        self.tree.rebuild(&*host, root)?;
        self.tree.discard_pending();
        self.expected = snapshot.top_hash;
        self.attempts = 0;
        info!(
            nodes = self.tree.len(),
            top_hash = %hasher::display(self.tree.top_hash()),
            "Replica rebuilt from snapshot"
        );
        if self.tree.top_hash() == self.expected {
            self.mark_synced();
            Ok(None)
        } else {
            self.attempts = self.retry_limit;
            self.fail()
        }
    }

    /// Apply repair commands through the host and re-hash every touched node.
    fn apply_repairs<H>(&mut self, host: &mut H, commands: &[RepairCommand]) -> Result<(), SyncError>
    where
        H: SceneHost<Object = O>,
    {
        let mut touched = Vec::new();
        for command in commands {
            let Some(key) = self.tree.lookup(command.identity()) else {
                self.record_fault(SyncFault::MissingDatablock {
                    identity: command.identity().clone(),
                    on_replica: true,
                });
                continue;
            };
            let object = self.object(key)?;
            if command.is_schema() {
                self.record_fault(SyncFault::Schema {
                    identity: command.identity().clone(),
                    attribute: command.attribute().to_string(),
                });
            }
            match command {
                RepairCommand::SetAttribute { attribute, value, .. }
                | RepairCommand::AddAttribute { attribute, value, .. } => {
                    host.set_attribute(&object, attribute, value.clone())
                }
                RepairCommand::RemoveAttribute { attribute, .. } => host.remove_attribute(&object, attribute),
            }
            touched.push(key);
        }
        self.tree.rescan_many(&*host, &touched)?;
        self.tree.discard_pending();
        debug!(repairs = commands.len(), "Repairs applied");
        self.progress
            .emit_best_effort("repair_applied", &self.repair_data(Some(commands.len())));
        Ok(())
    }

    fn finish_attempt(&mut self) -> Result<Option<SyncMessage>, SyncError> {
        if self.tree.top_hash() == self.expected {
            self.mark_synced();
            return Ok(None);
        }
        if self.attempts >= self.retry_limit {
            return self.fail();
        }
        debug!(attempt = self.attempts, "Still diverged, requesting a fresh manifest");
        self.round_trips.top_manifest += 1;
        Ok(Some(SyncMessage::RequestTopManifest))
    }

    fn mark_synced(&mut self) {
        if self.status != ReplicaStatus::Synced {
            info!(attempts = self.attempts, "Replica synced");
            self.progress.emit_best_effort("synced", &self.repair_data(None));
        }
        self.status = ReplicaStatus::Synced;
        self.attempts = 0;
    }

    fn fail(&mut self) -> Result<Option<SyncMessage>, SyncError> {
        self.status = ReplicaStatus::SyncFailed;
        warn!(
            attempts = self.attempts,
            local = %hasher::display(self.tree.top_hash()),
            expected = %hasher::display(self.expected),
            "Replica left in SyncFailed; full resync required"
        );
        self.progress.emit_best_effort("sync_failed", &self.repair_data(None));
        Err(SyncError::Divergence {
            attempts: self.attempts,
            local: self.tree.top_hash(),
            expected: self.expected,
        })
    }

    fn record_fault(&mut self, fault: SyncFault) {
        let (event, data) = match &fault {
            SyncFault::MissingDatablock { identity, on_replica } => {
                let detail = if *on_replica { "missing on replica" } else { "missing on controller" };
                warn!(identity = %identity, detail, "Missing datablock");
                (
                    "missing_datablock",
                    FaultData {
                        identity: identity.to_string(),
                        attribute: None,
                        detail: detail.to_string(),
                    },
                )
            }
            SyncFault::Schema { identity, attribute } => {
                warn!(identity = %identity, attribute = %attribute, "Schema fault repaired");
                (
                    "schema_fault",
                    FaultData {
                        identity: identity.to_string(),
                        attribute: Some(attribute.clone()),
                        detail: "attribute presence differs".to_string(),
                    },
                )
            }
        };
        self.progress.emit_best_effort(event, &data);
        self.faults.push(fault);
    }

    fn repair_data(&self, repairs: Option<usize>) -> RepairData {
        RepairData {
            local_top: hasher::display(self.tree.top_hash()),
            expected_top: hasher::display(self.expected),
            attempt: self.attempts,
            repairs,
        }
    }

    fn object(&self, key: NodeKey) -> Result<O, TreeError> {
        self.tree
            .get(key)
            .map(|n| n.object.clone())
            .ok_or(TreeError::StaleNode(key.as_u64()))
    }
}

/// Recreate a snapshot's structure under the host's root
///
/// The root's edges and attributes are replaced; every other snapshot node becomes
/// a fresh host object. Shared children are created once and linked from each
/// parent, so diamonds survive.
pub fn apply_snapshot<H: SceneHost>(host: &mut H, snapshot: &Snapshot) -> Result<(), SyncError> {
    let Some(root_entry) = snapshot.root() else {
        return Err(SyncError::Tree(TreeError::Empty));
    };
    let root = host.root();
    host.clear_edges(&root);
    host.rename(&root, &root_entry.stable_key);
    for (name, _) in host.attributes(&root) {
        host.remove_attribute(&root, &name);
    }

    let mut objects: HashMap<&Identity, H::Object> = HashMap::with_capacity(snapshot.nodes.len());
    objects.insert(&root_entry.identity, root);
    for node in snapshot.nodes.iter().skip(1) {
        let object = host.create_object(&node.stable_key, &node.type_tag, node.display_name.as_deref());
        objects.insert(&node.identity, object);
    }

    for node in &snapshot.nodes {
        let Some(object) = objects.get(&node.identity).cloned() else {
            continue;
        };
        for (name, value) in &node.attributes {
            host.set_attribute(&object, name, value.clone());
        }
        for (child, membership) in &node.edges {
            let Some(child_object) = objects.get(child) else {
                return Err(SyncError::Tree(TreeError::MalformedEdge {
                    parent: node.identity.clone(),
                    reason: format!("snapshot edge to unknown node {}", child),
                }));
            };
            host.link(&object, child_object, membership.as_deref());
        }
    }
    Ok(())
}
