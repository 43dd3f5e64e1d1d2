//! Hash tree arena, indices, full build and hash propagation

use crate::error::TreeError;
use crate::tree::hasher;
use crate::tree::history::UndoHistory;
use crate::tree::identity;
use crate::tree::incremental::{AttributeChange, IdentityRename};
use crate::tree::node::{ChildLink, HashNode, NodeKey, NodeState};
use crate::tree::rules::RuleProvider;
use crate::tree::{DiamondPolicy, TreeOptions};
use crate::types::{Hash, Identity, VolatileRef};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Live mirror of a host object graph.
///
/// Owns every node plus three indices (by volatile ref, by identity, by type),
/// the pending-sync queue and the undo history. One tree per process role.
#[derive(Debug, Clone)]
pub struct HashTree<O> {
    pub(crate) nodes: HashMap<NodeKey, HashNode<O>>,
    pub(crate) root: Option<NodeKey>,
    pub(crate) by_ref: HashMap<VolatileRef, NodeKey>,
    pub(crate) by_identity: HashMap<Identity, NodeKey>,
    pub(crate) by_type: HashMap<String, BTreeSet<NodeKey>>,
    pub(crate) pending: VecDeque<AttributeChange>,
    pub(crate) renames: Vec<IdentityRename>,
    pub(crate) history: UndoHistory,
    pub(crate) options: TreeOptions,
    /// Nodes whose own hash or child set changed since the last `settle`.
    pub(crate) stale: HashSet<NodeKey>,
    next_key: u64,
}

impl<O: Clone> HashTree<O> {
    /// Create an empty tree with the given options.
    pub fn new(options: TreeOptions) -> Self {
        Self {
            nodes: HashMap::new(),
            root: None,
            by_ref: HashMap::new(),
            by_identity: HashMap::new(),
            by_type: HashMap::new(),
            pending: VecDeque::new(),
            renames: Vec::new(),
            history: UndoHistory::new(),
            options,
            stale: HashSet::new(),
            next_key: 0,
        }
    }

    /// Build the complete hash tree from `root`
    ///
    /// Every object gets an identity and own hash on first discovery; children are
    /// built recursively and aggregates are back-filled bottom-up. An object reached
    /// a second time is linked to the new parent without being traversed again.
    #[instrument(skip_all)]
    pub fn build<R>(rules: &R, root: O, options: TreeOptions) -> Result<Self, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let mut tree = Self::new(options);
        tree.build_root(rules, root)?;
        let top = tree.top_hash();
        tree.history.record(top);
        Ok(tree)
    }

    pub(crate) fn build_root<R>(&mut self, rules: &R, root: O) -> Result<NodeKey, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let start = Instant::now();
        info!("Starting tree build");

        let root_key = self.discover(rules, root, None, None)?;
        self.root = Some(root_key);
        // Discovery aggregates bottom-up, so nothing is left to settle.
        self.stale.clear();
        let top = self.top_hash();

        info!(
            node_count = self.nodes.len(),
            top_hash = %hasher::display(top),
            duration_ms = start.elapsed().as_millis(),
            "Tree build completed"
        );
        Ok(root_key)
    }

    /// Discover `object` under `parent`, creating its node and subtree if unseen.
    pub(crate) fn discover<R>(
        &mut self,
        rules: &R,
        object: O,
        parent: Option<NodeKey>,
        membership: Option<String>,
    ) -> Result<NodeKey, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let vref = rules.volatile_ref(&object);
        if let Some(&existing) = self.by_ref.get(&vref) {
            if let Some(parent) = parent {
                self.attach(parent, existing, membership)?;
                trace!(node = %existing, "Reused node reached through another path");
            }
            return Ok(existing);
        }

        let stable_key = rules.stable_key(&object);
        let local = identity::local_key(membership.as_deref(), &stable_key, &self.options.separator);
        let parent_identity = match parent {
            Some(p) => Some(self.node(p)?.identity.clone()),
            None => None,
        };
        let identity = self.allocate_identity(parent_identity.as_ref(), &local)?;

        let type_tag = rules.type_tag(&object);
        let attribute_hashes: BTreeMap<String, Hash> = rules
            .attributes(&object)
            .iter()
            .map(|(name, value)| (name.clone(), rules.hash(value)))
            .collect();
        let own_hash = hasher::compute_own_hash(&identity, &type_tag, &attribute_hashes);

        let key = self.allocate_key();
        let mut parents = BTreeSet::new();
        if let Some(p) = parent {
            parents.insert(p);
        }
        let node = HashNode {
            key,
            identity,
            local_key: local,
            stable_key,
            primary_parent: parent,
            membership: membership.clone(),
            volatile_ref: vref,
            type_tag,
            display_name: rules.display_name(&object),
            object: object.clone(),
            own_hash,
            aggregate_hash: own_hash,
            parents,
            children: Vec::new(),
            attribute_hashes,
            state: NodeState::Unregistered,
        };
        self.register(node);

        if let Some(p) = parent {
            self.node_mut(p)?.children.push(ChildLink {
                node: key,
                membership,
            });
            self.stale.insert(p);
        }

        for edge in rules.edges(&object) {
            if let Err(e) = self.discover(rules, edge.child, Some(key), edge.membership) {
                warn!(parent = %key, error = %e, "Skipping child edge");
            }
        }

        self.recompute_aggregate(key);
        Ok(key)
    }

    /// Link an existing node as a child of `parent`.
    pub(crate) fn attach(
        &mut self,
        parent: NodeKey,
        child: NodeKey,
        membership: Option<String>,
    ) -> Result<(), TreeError> {
        if self.is_ancestor_or_self(child, parent) {
            return Err(TreeError::Cycle {
                parent: self.node(parent)?.identity.clone(),
                child: self.node(child)?.identity.clone(),
            });
        }
        let parent_node = self.node_mut(parent)?;
        if parent_node.has_link(child, membership.as_deref()) {
            return Ok(());
        }
        parent_node.children.push(ChildLink {
            node: child,
            membership,
        });
        self.node_mut(child)?.parents.insert(parent);
        self.stale.insert(parent);
        Ok(())
    }

    /// Whether `candidate` is `node` or one of its ancestors.
    pub(crate) fn is_ancestor_or_self(&self, candidate: NodeKey, node: NodeKey) -> bool {
        let mut stack = vec![node];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == candidate {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(n) = self.nodes.get(&current) {
                stack.extend(n.parents.iter().copied());
            }
        }
        false
    }

    fn allocate_key(&mut self) -> NodeKey {
        let key = NodeKey(self.next_key);
        self.next_key += 1;
        key
    }

    /// Derive a unique identity, suffixing on collision.
    pub(crate) fn allocate_identity(
        &self,
        parent: Option<&Identity>,
        local_key: &str,
    ) -> Result<Identity, TreeError> {
        let candidate = identity::derive(parent, local_key, &self.options.separator);
        identity::disambiguate(candidate.clone(), self.options.max_suffix, |c| {
            self.by_identity.contains_key(c)
        })
        .ok_or(TreeError::IdentityCollision(candidate, self.options.max_suffix))
    }

    /// Insert a node into the arena and all three indices.
    fn register(&mut self, mut node: HashNode<O>) {
        node.state = NodeState::Registered;
        self.by_ref.insert(node.volatile_ref, node.key);
        self.by_identity.insert(node.identity.clone(), node.key);
        self.by_type
            .entry(node.type_tag.clone())
            .or_default()
            .insert(node.key);
        self.nodes.insert(node.key, node);
    }

    /// Remove a node from the arena and all indices. Terminal.
    pub(crate) fn unregister(&mut self, key: NodeKey) -> Option<HashNode<O>> {
        let mut node = self.nodes.remove(&key)?;
        if self.by_ref.get(&node.volatile_ref) == Some(&key) {
            self.by_ref.remove(&node.volatile_ref);
        }
        if self.by_identity.get(&node.identity) == Some(&key) {
            self.by_identity.remove(&node.identity);
        }
        if let Some(set) = self.by_type.get_mut(&node.type_tag) {
            set.remove(&key);
            if set.is_empty() {
                self.by_type.remove(&node.type_tag);
            }
        }
        if self.root == Some(key) {
            self.root = None;
        }
        node.state = NodeState::Invalidated;
        debug!(identity = %node.identity, "Node invalidated");
        Some(node)
    }

    /// Move a node between type buckets after its type tag changed.
    pub(crate) fn retype(&mut self, key: NodeKey, old: &str, new: &str) {
        if old == new {
            return;
        }
        if let Some(set) = self.by_type.get_mut(old) {
            set.remove(&key);
            if set.is_empty() {
                self.by_type.remove(old);
            }
        }
        self.by_type.entry(new.to_string()).or_default().insert(key);
    }

    /// Recompute one node's aggregate from scratch, without propagating.
    pub(crate) fn recompute_aggregate(&mut self, key: NodeKey) -> Hash {
        let value = match self.options.diamond_policy {
            DiamondPolicy::PerEdge => match self.nodes.get(&key) {
                Some(node) => node.children.iter().fold(node.own_hash, |acc, link| {
                    let child = self.nodes.get(&link.node).map_or(0, |c| c.aggregate_hash);
                    acc.wrapping_add(child)
                }),
                None => return 0,
            },
            DiamondPolicy::CountOnce => self.unique_own_sum(key),
        };
        if let Some(node) = self.nodes.get_mut(&key) {
            node.aggregate_hash = value;
        }
        value
    }

    /// Sum of own hashes over the distinct nodes reachable from `key`.
    pub fn unique_own_sum(&self, key: NodeKey) -> Hash {
        let mut seen = HashSet::new();
        let mut stack = vec![key];
        let mut sum: Hash = 0;
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                sum = sum.wrapping_add(node.own_hash);
                stack.extend(node.child_keys());
            }
        }
        sum
    }

    /// Recompute `key`'s aggregate and propagate to every ancestor
    ///
    /// Recomputation is from scratch, which makes repeated calls idempotent.
    pub fn aggregate(&mut self, key: NodeKey) -> Result<Hash, TreeError> {
        self.node(key)?;
        self.aggregate_many([key]);
        Ok(self.node(key)?.aggregate_hash)
    }

    /// Recompute every node that has one of `keys` as a descendant (or is one)
    ///
    /// Nodes are processed in dependency order: a node only after all of its
    /// children inside the affected set. Each is recomputed exactly once per call
    /// no matter how many paths lead to it.
    pub fn aggregate_many<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = NodeKey>,
    {
        let affected = self.ancestors_inclusive(keys);
        let mut pending: HashMap<NodeKey, usize> = HashMap::with_capacity(affected.len());
        for &n in &affected {
            let inside: HashSet<NodeKey> = self
                .nodes
                .get(&n)
                .map(|node| node.child_keys().filter(|c| affected.contains(c)).collect())
                .unwrap_or_default();
            pending.insert(n, inside.len());
        }

        let mut ready: VecDeque<NodeKey> = pending
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&n, _)| n)
            .collect();
        while let Some(n) = ready.pop_front() {
            self.recompute_aggregate(n);
            let parents: Vec<NodeKey> = self
                .nodes
                .get(&n)
                .map(|node| node.parents.iter().copied().collect())
                .unwrap_or_default();
            for p in parents {
                if let Some(count) = pending.get_mut(&p) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(p);
                    }
                }
            }
        }
    }

    /// Re-aggregate above every stale node plus `extra`, then clear the stale set.
    ///
    /// A rename rekeys descendants, and a rekeyed node shared through a diamond has
    /// parents outside the renamed branch; they all have to be recomputed here.
    pub(crate) fn settle(&mut self, extra: &[NodeKey]) -> Hash {
        let mut seeds: HashSet<NodeKey> = self.stale.drain().collect();
        seeds.extend(extra.iter().copied());
        seeds.retain(|k| self.nodes.contains_key(k));
        if !seeds.is_empty() {
            trace!(seeds = seeds.len(), "Settling aggregates");
            self.aggregate_many(seeds);
        }
        self.top_hash()
    }

    fn ancestors_inclusive<I>(&self, keys: I) -> HashSet<NodeKey>
    where
        I: IntoIterator<Item = NodeKey>,
    {
        let mut out = HashSet::new();
        let mut stack: Vec<NodeKey> = keys.into_iter().collect();
        while let Some(current) = stack.pop() {
            if !out.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.parents.iter().copied());
            }
        }
        out
    }

    /// Nodes in traversal pre-order from the root, each visited once.
    pub fn pre_order(&self) -> Vec<NodeKey> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let Some(root) = self.root else {
            return out;
        };
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            out.push(current);
            if let Some(node) = self.nodes.get(&current) {
                for child in node.child_keys().collect::<Vec<_>>().into_iter().rev() {
                    if !seen.contains(&child) {
                        stack.push(child);
                    }
                }
            }
        }
        out
    }

    /// Rebuild the volatile-ref cache from the identity index
    ///
    /// Called after the host invalidated its memory handles (undo/redo, reload)
    /// while the objects themselves remain reachable.
    pub fn refresh_volatile_refs<R>(&mut self, rules: &R)
    where
        R: RuleProvider<Object = O>,
    {
        self.by_ref.clear();
        for &key in self.by_identity.values() {
            if let Some(node) = self.nodes.get_mut(&key) {
                node.volatile_ref = rules.volatile_ref(&node.object);
                self.by_ref.insert(node.volatile_ref, key);
            }
        }
        debug!(entries = self.by_ref.len(), "Volatile reference cache rebuilt");
    }

    /// Invalidate the whole tree and build it again from `root`.
    ///
    /// History and options survive; pending changes recorded so far are kept.
    #[instrument(skip_all)]
    pub fn rebuild<R>(&mut self, rules: &R, root: O) -> Result<Hash, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let top = self.reconstruct(rules, root)?;
        self.history.record(top);
        Ok(top)
    }

    /// Drop every node and build again from `root` without touching history.
    pub(crate) fn reconstruct<R>(&mut self, rules: &R, root: O) -> Result<Hash, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        if let Some(old_root) = self.root {
            self.remove_branch(old_root)?;
        }
        self.nodes.clear();
        self.by_ref.clear();
        self.by_identity.clear();
        self.by_type.clear();
        self.stale.clear();
        self.build_root(rules, root)?;
        Ok(self.top_hash())
    }

    pub(crate) fn node(&self, key: NodeKey) -> Result<&HashNode<O>, TreeError> {
        self.nodes.get(&key).ok_or(TreeError::StaleNode(key.0))
    }

    pub(crate) fn node_mut(&mut self, key: NodeKey) -> Result<&mut HashNode<O>, TreeError> {
        self.nodes.get_mut(&key).ok_or(TreeError::StaleNode(key.0))
    }

    /// Aggregate hash of the root (0 for an empty tree).
    pub fn top_hash(&self) -> Hash {
        self.root
            .and_then(|r| self.nodes.get(&r))
            .map_or(0, |n| n.aggregate_hash)
    }

    pub fn root(&self) -> Option<NodeKey> {
        self.root
    }

    pub fn get(&self, key: NodeKey) -> Option<&HashNode<O>> {
        self.nodes.get(&key)
    }

    pub fn lookup(&self, identity: &Identity) -> Option<NodeKey> {
        self.by_identity.get(identity).copied()
    }

    pub fn get_by_identity(&self, identity: &Identity) -> Option<&HashNode<O>> {
        self.lookup(identity).and_then(|k| self.nodes.get(&k))
    }

    pub fn lookup_ref(&self, vref: VolatileRef) -> Option<NodeKey> {
        self.by_ref.get(&vref).copied()
    }

    pub fn nodes_of_type(&self, type_tag: &str) -> Vec<NodeKey> {
        self.by_type
            .get(type_tag)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HashNode<O>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    pub fn history(&self) -> &UndoHistory {
        &self.history
    }
}
