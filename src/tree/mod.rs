//! Scene Hash Tree
//!
//! Mirrors the host's object DAG as an arena of hash nodes, each carrying a stable
//! identity, an own-data hash over its leaf attributes and an aggregate hash over
//! everything reachable from it. The root aggregate is the replica's top hash.

pub mod builder;
pub mod hasher;
pub mod history;
pub mod identity;
pub mod incremental;
pub mod node;
pub mod removal;
pub mod rules;

pub use builder::HashTree;
pub use history::UndoHistory;
pub use incremental::{AttributeChange, ChangeBatch, IdentityRename};
pub use node::{ChildLink, HashNode, NodeKey, NodeState};
pub use rules::{Edge, RuleProvider, SceneHost};

use serde::{Deserialize, Serialize};

/// How a descendant reachable through several paths contributes to an ancestor's aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiamondPolicy {
    /// Each distinct reachable node contributes its own hash exactly once.
    ///
    /// Every recompute walks the node's whole sub-DAG, so a build costs
    /// O(N x reachable) instead of O(N), and a rescan pays one walk per affected
    /// ancestor. Reachable sets are not cached; use `PerEdge` for very deep scenes.
    #[default]
    CountOnce,
    /// `aggregate = own + sum(child aggregates)`, once per incoming edge.
    PerEdge,
}

/// Tree construction options. Replicas must agree on these to agree on hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeOptions {
    pub diamond_policy: DiamondPolicy,
    /// Separator placed between ancestor identities and local keys.
    pub separator: String,
    /// Largest numeric suffix tried before an identity collision is fatal.
    pub max_suffix: u32,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            diamond_policy: DiamondPolicy::CountOnce,
            separator: "/".to_string(),
            max_suffix: 10_000,
        }
    }
}

impl TreeOptions {
    pub fn with_policy(mut self, policy: DiamondPolicy) -> Self {
        self.diamond_policy = policy;
        self
    }
}
