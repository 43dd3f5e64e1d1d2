//! Hash tree node types

use crate::types::{Hash, Identity, VolatileRef};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Arena slot of a node inside one `HashTree`.
///
/// Keys are never reused, so a handle to a removed node stays invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub(crate) u64);

impl NodeKey {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registration state of a node's identity.
///
/// `Unregistered -> Registered -> Invalidated`; `Invalidated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unregistered,
    Registered,
    Invalidated,
}

/// A child edge, tagged with the collection it was reached through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildLink {
    pub node: NodeKey,
    pub membership: Option<String>,
}

/// Mirror of exactly one host object.
#[derive(Debug, Clone)]
pub struct HashNode<O> {
    pub key: NodeKey,
    pub identity: Identity,
    /// Normalized membership + host key this identity was derived from.
    pub local_key: String,
    /// Host stable key as last observed, used to detect renames.
    pub stable_key: String,
    /// Parent whose identity prefixes this node's identity.
    pub primary_parent: Option<NodeKey>,
    /// Membership of the link from the primary parent.
    pub membership: Option<String>,
    pub volatile_ref: VolatileRef,
    pub type_tag: String,
    pub display_name: Option<String>,
    pub object: O,
    pub own_hash: Hash,
    pub aggregate_hash: Hash,
    pub parents: BTreeSet<NodeKey>,
    pub children: Vec<ChildLink>,
    pub attribute_hashes: BTreeMap<String, Hash>,
    pub state: NodeState,
}

impl<O> HashNode<O> {
    pub fn child_keys(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.children.iter().map(|link| link.node)
    }

    /// Whether this node links to `child` through `membership`.
    pub fn has_link(&self, child: NodeKey, membership: Option<&str>) -> bool {
        self.children
            .iter()
            .any(|link| link.node == child && link.membership.as_deref() == membership)
    }
}
