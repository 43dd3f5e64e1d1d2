//! Sync wire contract
//!
//! Everything a controller and a replica exchange: change records, identity
//! renames, top-level and attribute manifests, repair commands and full snapshots.
//! Messages travel as [`SyncMessage`] encoded with bincode; the transport is
//! someone else's problem.

use crate::error::SyncError;
use crate::tree::{ChangeBatch, HashTree, IdentityRename, RuleProvider};
use crate::types::{AttrValue, Hash, Identity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One attribute-level change, stamped with the controller's top hash after the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub identity: Identity,
    pub attribute: String,
    /// `None` when the attribute was removed.
    pub new_value: Option<AttrValue>,
    pub top_hash: Hash,
}

/// What the controller broadcasts after each mutation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub top_hash: Hash,
    pub renames: Vec<IdentityRename>,
    pub changes: Vec<ChangeRecord>,
}

impl From<ChangeBatch> for Announcement {
    fn from(batch: ChangeBatch) -> Self {
        let top_hash = batch.top_hash;
        let changes = batch
            .changes
            .into_iter()
            .map(|c| ChangeRecord {
                identity: c.identity,
                attribute: c.attribute,
                new_value: c.new_value,
                top_hash,
            })
            .collect();
        Self {
            top_hash,
            renames: batch.renames,
            changes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub aggregate_hash: Hash,
    pub own_hash: Hash,
}

/// `identity -> (aggregate, own)` for every node of one tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopManifest {
    pub top_hash: Hash,
    pub entries: BTreeMap<Identity, ManifestEntry>,
}

impl TopManifest {
    pub fn capture<O: Clone>(tree: &HashTree<O>) -> Self {
        let entries = tree
            .iter()
            .map(|n| {
                (
                    n.identity.clone(),
                    ManifestEntry {
                        aggregate_hash: n.aggregate_hash,
                        own_hash: n.own_hash,
                    },
                )
            })
            .collect();
        Self {
            top_hash: tree.top_hash(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Attribute hashes and authoritative values for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeManifest {
    pub identity: Identity,
    pub hashes: BTreeMap<String, Hash>,
    pub values: BTreeMap<String, AttrValue>,
}

impl AttributeManifest {
    /// Read the node's current attributes through the host. `None` for unknown identities.
    pub fn capture<O, R>(tree: &HashTree<O>, rules: &R, identity: &Identity) -> Option<Self>
    where
        O: Clone,
        R: RuleProvider<Object = O>,
    {
        let node = tree.get_by_identity(identity)?;
        let mut hashes = BTreeMap::new();
        let mut values = BTreeMap::new();
        for (name, value) in rules.attributes(&node.object) {
            hashes.insert(name.clone(), rules.hash(&value));
            values.insert(name, value);
        }
        Some(Self {
            identity: identity.clone(),
            hashes,
            values,
        })
    }
}

/// Instruction to bring one attribute on the stale side back in line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RepairCommand {
    /// Value mismatch: overwrite with the authoritative value.
    SetAttribute {
        identity: Identity,
        attribute: String,
        value: AttrValue,
    },
    /// Schema fault: the attribute is missing on the stale side.
    AddAttribute {
        identity: Identity,
        attribute: String,
        value: AttrValue,
    },
    /// Schema fault: the attribute exists only on the stale side.
    RemoveAttribute { identity: Identity, attribute: String },
}

impl RepairCommand {
    pub fn identity(&self) -> &Identity {
        match self {
            RepairCommand::SetAttribute { identity, .. }
            | RepairCommand::AddAttribute { identity, .. }
            | RepairCommand::RemoveAttribute { identity, .. } => identity,
        }
    }

    pub fn attribute(&self) -> &str {
        match self {
            RepairCommand::SetAttribute { attribute, .. }
            | RepairCommand::AddAttribute { attribute, .. }
            | RepairCommand::RemoveAttribute { attribute, .. } => attribute,
        }
    }

    pub fn is_schema(&self) -> bool {
        !matches!(self, RepairCommand::SetAttribute { .. })
    }
}

/// Compare local attribute hashes with an authoritative manifest.
///
/// Commands are ordered by attribute name for a given node.
pub fn plan_repairs(local: &BTreeMap<String, Hash>, remote: &AttributeManifest) -> Vec<RepairCommand> {
    let mut commands = Vec::new();
    for (name, hash) in &remote.hashes {
        let Some(value) = remote.values.get(name) else {
            continue;
        };
        match local.get(name) {
            Some(local_hash) if local_hash == hash => {}
            Some(_) => commands.push(RepairCommand::SetAttribute {
                identity: remote.identity.clone(),
                attribute: name.clone(),
                value: value.clone(),
            }),
            None => commands.push(RepairCommand::AddAttribute {
                identity: remote.identity.clone(),
                attribute: name.clone(),
                value: value.clone(),
            }),
        }
    }
    for name in local.keys() {
        if !remote.hashes.contains_key(name) {
            commands.push(RepairCommand::RemoveAttribute {
                identity: remote.identity.clone(),
                attribute: name.clone(),
            });
        }
    }
    commands
}

/// One node of a full snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub identity: Identity,
    pub stable_key: String,
    pub type_tag: String,
    pub display_name: Option<String>,
    pub attributes: Vec<(String, AttrValue)>,
    /// Ordered `(child identity, membership)` pairs.
    pub edges: Vec<(Identity, Option<String>)>,
}

/// Whole-tree structural dump used for operator-triggered full resync.
///
/// Nodes are listed in traversal pre-order, so the first entry is the root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub top_hash: Hash,
    pub nodes: Vec<SnapshotNode>,
}

impl Snapshot {
    pub fn capture<O, R>(tree: &HashTree<O>, rules: &R) -> Self
    where
        O: Clone,
        R: RuleProvider<Object = O>,
    {
        let nodes = tree
            .pre_order()
            .into_iter()
            .filter_map(|key| tree.get(key))
            .map(|node| SnapshotNode {
                identity: node.identity.clone(),
                stable_key: node.stable_key.clone(),
                type_tag: node.type_tag.clone(),
                display_name: node.display_name.clone(),
                attributes: rules.attributes(&node.object),
                edges: node
                    .children
                    .iter()
                    .filter_map(|link| {
                        tree.get(link.node)
                            .map(|child| (child.identity.clone(), link.membership.clone()))
                    })
                    .collect(),
            })
            .collect();
        Self {
            top_hash: tree.top_hash(),
            nodes,
        }
    }

    pub fn root(&self) -> Option<&SnapshotNode> {
        self.nodes.first()
    }

    /// Index from identity to position in `nodes`.
    pub fn index(&self) -> HashMap<&Identity, usize> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (&n.identity, i))
            .collect()
    }
}

/// Envelope for every sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    Announce(Announcement),
    RequestTopManifest,
    TopManifest(TopManifest),
    RequestAttributes(Vec<Identity>),
    Attributes(Vec<AttributeManifest>),
    Repair(Vec<RepairCommand>),
    RequestSnapshot,
    Snapshot(Snapshot),
}

impl SyncMessage {
    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::Announce(_) => "announce",
            SyncMessage::RequestTopManifest => "request_top_manifest",
            SyncMessage::TopManifest(_) => "top_manifest",
            SyncMessage::RequestAttributes(_) => "request_attributes",
            SyncMessage::Attributes(_) => "attributes",
            SyncMessage::Repair(_) => "repair",
            SyncMessage::RequestSnapshot => "request_snapshot",
            SyncMessage::Snapshot(_) => "snapshot",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serialize(self).map_err(|e| SyncError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        bincode::deserialize(bytes).map_err(|e| SyncError::Codec(e.to_string()))
    }
}
