//! Node deletion: reference removal and whole-branch invalidation

use crate::error::TreeError;
use crate::tree::builder::HashTree;
use crate::tree::node::{HashNode, NodeKey};
use std::collections::HashSet;
use tracing::{debug, info};

impl<O: Clone> HashTree<O> {
    /// Remove one `parent -> child` link
    ///
    /// The child loses `parent` from its parent set once no link from that parent
    /// remains. It is detached from the indices only when its parent set is empty;
    /// detaching drops its own child references in turn, so a shared descendant
    /// survives as long as any other parent still holds it. Returns the nodes that
    /// were detached, already marked `Invalidated`. Ancestors of `parent` are only
    /// marked stale here; `remove_child` re-aggregates them.
    pub fn remove_reference(
        &mut self,
        child: NodeKey,
        parent: NodeKey,
        membership: Option<&str>,
    ) -> Result<Vec<HashNode<O>>, TreeError> {
        let parent_node = self.node_mut(parent)?;
        let position = parent_node
            .children
            .iter()
            .position(|l| l.node == child && l.membership.as_deref() == membership);
        let Some(position) = position else {
            return Err(TreeError::MalformedEdge {
                parent: parent_node.identity.clone(),
                reason: format!("no link to {} through {:?}", child, membership),
            });
        };
        parent_node.children.remove(position);
        let still_linked = parent_node.children.iter().any(|l| l.node == child);
        self.stale.insert(parent);

        let mut removed = Vec::new();
        if !still_linked {
            self.drop_parent(child, parent, &mut removed)?;
        }
        Ok(removed)
    }

    /// Remove a link and re-aggregate the former parent and its ancestors.
    pub fn remove_child(
        &mut self,
        child: NodeKey,
        parent: NodeKey,
        membership: Option<&str>,
    ) -> Result<Vec<HashNode<O>>, TreeError> {
        let removed = self.remove_reference(child, parent, membership)?;
        self.settle(&[parent]);
        Ok(removed)
    }

    fn drop_parent(
        &mut self,
        child: NodeKey,
        parent: NodeKey,
        removed: &mut Vec<HashNode<O>>,
    ) -> Result<(), TreeError> {
        let node = self.node_mut(child)?;
        node.parents.remove(&parent);
        if !node.parents.is_empty() {
            if node.primary_parent == Some(parent) {
                // Name the node through a parent that still holds it.
                node.primary_parent = node.parents.iter().next().copied();
                let new_primary = node.primary_parent;
                let membership = new_primary
                    .and_then(|p| self.nodes.get(&p))
                    .and_then(|p| p.children.iter().find(|l| l.node == child))
                    .and_then(|l| l.membership.clone());
                let separator = self.options.separator.clone();
                let node = self.node_mut(child)?;
                node.membership = membership;
                node.local_key = crate::tree::identity::local_key(
                    node.membership.as_deref(),
                    &node.stable_key,
                    &separator,
                );
                self.reidentify(child)?;
            }
            return Ok(());
        }
        self.detach(child, removed)
    }

    fn detach(&mut self, key: NodeKey, removed: &mut Vec<HashNode<O>>) -> Result<(), TreeError> {
        let Some(node) = self.unregister(key) else {
            return Ok(());
        };
        let mut children: Vec<NodeKey> = node.child_keys().collect();
        children.sort();
        children.dedup();
        removed.push(node);
        for child in children {
            if self.nodes.contains_key(&child) {
                self.drop_parent(child, key, removed)?;
            }
        }
        Ok(())
    }

    /// Invalidate `key` and every descendant unconditionally
    ///
    /// Used when volatile references become meaningless and the branch must be
    /// rebuilt from scratch. Links from surviving parents into the branch are cut
    /// and those parents re-aggregated.
    pub fn remove_branch(&mut self, key: NodeKey) -> Result<Vec<HashNode<O>>, TreeError> {
        self.node(key)?;

        let mut branch = HashSet::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            if !branch.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.child_keys());
            }
        }

        let mut outside_parents = HashSet::new();
        for &member in &branch {
            if let Some(node) = self.nodes.get(&member) {
                outside_parents.extend(node.parents.iter().copied().filter(|p| !branch.contains(p)));
            }
        }
        for &parent in &outside_parents {
            if let Some(node) = self.nodes.get_mut(&parent) {
                node.children.retain(|l| !branch.contains(&l.node));
            }
        }

        let mut removed = Vec::with_capacity(branch.len());
        for member in branch {
            if let Some(node) = self.unregister(member) {
                removed.push(node);
            }
        }
        let outside: Vec<NodeKey> = outside_parents.into_iter().collect();
        self.settle(&outside);

        info!(removed = removed.len(), "Branch invalidated");
        debug!(remaining = self.nodes.len(), "Tree size after branch removal");
        Ok(removed)
    }
}
