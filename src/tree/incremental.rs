//! Incremental rescan, renames and the pending-sync queue

use crate::error::TreeError;
use crate::tree::builder::HashTree;
use crate::tree::hasher;
use crate::tree::identity;
use crate::tree::node::{ChildLink, NodeKey};
use crate::tree::rules::RuleProvider;
use crate::types::{AttrValue, Hash, Identity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, instrument, warn};

/// One attribute whose hash changed since the last scan.
///
/// `new_value` is `None` when the attribute disappeared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub identity: Identity,
    pub attribute: String,
    pub new_value: Option<AttrValue>,
}

/// Identity rekey caused by a host rename or a lost primary parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRename {
    pub old: Identity,
    pub new: Identity,
    /// Host stable key after the rename.
    pub stable_key: String,
}

/// Everything queued since the previous batch, stamped with the resulting top hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub top_hash: Hash,
    pub changes: Vec<AttributeChange>,
    pub renames: Vec<IdentityRename>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.renames.is_empty()
    }
}

impl<O: Clone> HashTree<O> {
    /// Rescan `key` after a known host mutation, propagate, and return the new top hash.
    #[instrument(skip(self, rules), fields(node = %key))]
    pub fn rescan<R>(&mut self, rules: &R, key: NodeKey) -> Result<Hash, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let mut visited = HashSet::new();
        self.rescan_node(rules, key, &mut visited)?;
        Ok(self.settle(&[key]))
    }

    /// Rescan several nodes as one pass sharing a visited set.
    pub fn rescan_many<R>(&mut self, rules: &R, keys: &[NodeKey]) -> Result<Hash, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let mut visited = HashSet::new();
        for &key in keys {
            if self.nodes.contains_key(&key) {
                self.rescan_node(rules, key, &mut visited)?;
            }
        }
        Ok(self.settle(keys))
    }

    /// Rescan one node and its retained children
    ///
    /// Recomputes the own hash, queues one change record per attribute whose hash
    /// changed, and re-parses edges to pick up added and removed children.
    /// `visited` keeps a node reachable through several paths from being processed
    /// twice in one pass. Aggregates are left stale; callers follow with `settle`.
    pub fn rescan_node<R>(
        &mut self,
        rules: &R,
        key: NodeKey,
        visited: &mut HashSet<NodeKey>,
    ) -> Result<(), TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        if !visited.insert(key) {
            return Ok(());
        }
        let object = self.node(key)?.object.clone();

        let stable_key = rules.stable_key(&object);
        if stable_key != self.node(key)?.stable_key {
            self.rename_node(key, &stable_key)?;
        }

        self.rescan_attributes(rules, key, &object)?;
        let retained = self.rescan_edges(rules, key, &object)?;

        for child in retained {
            if self.nodes.contains_key(&child) {
                self.rescan_node(rules, child, visited)?;
            }
        }
        Ok(())
    }

    fn rescan_attributes<R>(&mut self, rules: &R, key: NodeKey, object: &O) -> Result<(), TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let attributes = rules.attributes(object);
        let type_tag = rules.type_tag(object);
        let display_name = rules.display_name(object);

        let node = self.node(key)?;
        let identity = node.identity.clone();
        let old_type = node.type_tag.clone();
        let mut fresh: BTreeMap<String, Hash> = BTreeMap::new();
        let mut changes = Vec::new();

        for (name, value) in attributes {
            let hash = rules.hash(&value);
            if node.attribute_hashes.get(&name) != Some(&hash) {
                changes.push(AttributeChange {
                    identity: identity.clone(),
                    attribute: name.clone(),
                    new_value: Some(value),
                });
            }
            fresh.insert(name, hash);
        }
        for name in node.attribute_hashes.keys() {
            if !fresh.contains_key(name) {
                changes.push(AttributeChange {
                    identity: identity.clone(),
                    attribute: name.clone(),
                    new_value: None,
                });
            }
        }

        if !changes.is_empty() {
            debug!(identity = %identity, changed = changes.len(), "Attribute hashes changed");
        }
        self.pending.extend(changes);

        let own_hash = hasher::compute_own_hash(&identity, &type_tag, &fresh);
        let node = self.node_mut(key)?;
        if node.own_hash != own_hash {
            self.stale.insert(key);
        }
        let node = self.node_mut(key)?;
        node.attribute_hashes = fresh;
        node.own_hash = own_hash;
        node.display_name = display_name;
        node.type_tag = type_tag.clone();
        self.retype(key, &old_type, &type_tag);
        Ok(())
    }

    /// Reconcile child links with the host's current edges.
    ///
    /// Returns the children that existed before and are still linked.
    fn rescan_edges<R>(
        &mut self,
        rules: &R,
        key: NodeKey,
        object: &O,
    ) -> Result<Vec<NodeKey>, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let before: Vec<ChildLink> = self.node(key)?.children.clone();
        let mut desired: Vec<ChildLink> = Vec::new();
        let mut retained = Vec::new();

        for edge in rules.edges(object) {
            let vref = rules.volatile_ref(&edge.child);
            let child = match self.by_ref.get(&vref).copied() {
                Some(existing) => {
                    let already = before
                        .iter()
                        .any(|l| l.node == existing && l.membership == edge.membership);
                    if already {
                        retained.push(existing);
                    } else if let Err(e) = self.attach(key, existing, edge.membership.clone()) {
                        warn!(parent = %key, error = %e, "Rejected edge during rescan");
                        continue;
                    }
                    existing
                }
                None => match self.discover(rules, edge.child, Some(key), edge.membership.clone()) {
                    Ok(created) => created,
                    Err(e) => {
                        warn!(parent = %key, error = %e, "Failed to discover new child");
                        continue;
                    }
                },
            };
            desired.push(ChildLink {
                node: child,
                membership: edge.membership,
            });
        }

        for link in &before {
            if !desired.contains(link) {
                self.remove_reference(link.node, key, link.membership.as_deref())?;
            }
        }

        // Match the host's edge order.
        let node = self.node_mut(key)?;
        if node.children != desired {
            node.children = desired;
            self.stale.insert(key);
        }
        Ok(retained)
    }

    /// Apply a host-side key change to `key` and every descendant it names.
    pub(crate) fn rename_node(&mut self, key: NodeKey, new_stable_key: &str) -> Result<(), TreeError> {
        let separator = self.options.separator.clone();
        let node = self.node_mut(key)?;
        node.stable_key = new_stable_key.to_string();
        node.local_key = identity::local_key(node.membership.as_deref(), new_stable_key, &separator);
        self.reidentify(key)
    }

    /// Recompute `key`'s identity from its primary parent and rekey the index
    ///
    /// Descendants named through `key` are rekeyed too. Each change queues an
    /// `IdentityRename` so replicas update their index instead of seeing delete+add,
    /// and marks the node stale for the next `settle`.
    pub(crate) fn reidentify(&mut self, key: NodeKey) -> Result<(), TreeError> {
        let node = self.node(key)?;
        let old = node.identity.clone();
        let local_key = node.local_key.clone();
        let parent_identity = match node.primary_parent {
            Some(p) => Some(self.node(p)?.identity.clone()),
            None => None,
        };
        let candidate = identity::derive(parent_identity.as_ref(), &local_key, &self.options.separator);
        if identity_matches(&old, &candidate) {
            return Ok(());
        }

        self.by_identity.remove(&old);
        let new = match self.allocate_identity(parent_identity.as_ref(), &local_key) {
            Ok(id) => id,
            Err(e) => {
                self.by_identity.insert(old, key);
                return Err(e);
            }
        };
        self.by_identity.insert(new.clone(), key);

        let node = self.node_mut(key)?;
        node.identity = new.clone();
        node.own_hash = hasher::compute_own_hash(&new, &node.type_tag, &node.attribute_hashes);
        self.stale.insert(key);
        let node = self.node(key)?;
        let stable_key = node.stable_key.clone();
        let mut named: Vec<NodeKey> = node.child_keys().collect();
        named.dedup();

        info!(old = %old, new = %new, "Identity rekeyed");
        self.renames.push(IdentityRename {
            old,
            new,
            stable_key,
        });

        for child in named {
            let primary = self.nodes.get(&child).and_then(|c| c.primary_parent);
            if primary == Some(key) {
                self.reidentify(child)?;
            }
        }
        Ok(())
    }

    /// Drain the pending-sync queue as one batch.
    ///
    /// Records the resulting top hash in the undo history once per batch, and only
    /// when it differs from the current snapshot.
    pub fn take_batch(&mut self) -> ChangeBatch {
        let top_hash = self.top_hash();
        if self.history.current() != Some(top_hash) {
            self.history.record(top_hash);
        }
        ChangeBatch {
            top_hash,
            changes: self.pending.drain(..).collect(),
            renames: std::mem::take(&mut self.renames),
        }
    }

    /// Drop queued records without emitting them (used by replicas, which never announce).
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.renames.clear();
    }
}

/// `old` is `candidate` or `candidate` plus a collision suffix.
fn identity_matches(old: &Identity, candidate: &Identity) -> bool {
    let old = old.as_str();
    let candidate = candidate.as_str();
    if old == candidate {
        return true;
    }
    match old.strip_prefix(candidate) {
        Some(rest) => rest
            .strip_prefix(identity::SUFFIX_SEPARATOR)
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())),
        None => false,
    }
}
