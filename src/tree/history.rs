//! Undo history of top-hash snapshots.

use crate::error::TreeError;
use crate::tree::builder::HashTree;
use crate::tree::hasher;
use crate::tree::rules::RuleProvider;
use crate::types::Hash;
use tracing::{info, warn};

/// Append-only list of top hashes with a cursor.
///
/// Entries are never reordered. Recording while the cursor is behind the tail
/// truncates the redo branch first.
#[derive(Debug, Clone, Default)]
pub struct UndoHistory {
    snapshots: Vec<Hash>,
    position: usize,
}

impl UndoHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new top hash at the cursor.
    pub fn record(&mut self, top_hash: Hash) {
        if self.position < self.snapshots.len() {
            self.snapshots.truncate(self.position);
        }
        self.snapshots.push(top_hash);
        self.position = self.snapshots.len();
    }

    /// Step back one snapshot; returns the top hash the tree should now have.
    pub fn undo(&mut self) -> Option<Hash> {
        if self.position <= 1 {
            return None;
        }
        self.position -= 1;
        self.current()
    }

    pub fn redo(&mut self) -> Option<Hash> {
        if self.position >= self.snapshots.len() {
            return None;
        }
        self.position += 1;
        self.current()
    }

    pub fn current(&self) -> Option<Hash> {
        if self.position == 0 {
            None
        } else {
            self.snapshots.get(self.position - 1).copied()
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[Hash] {
        &self.snapshots
    }
}

impl<O: Clone> HashTree<O> {
    /// Step back one snapshot after the host undid an edit
    ///
    /// Returns `None` at the start of history. Otherwise the tree is brought in
    /// line with the host and the snapshot it was expected to match is returned.
    pub fn undo<R>(&mut self, rules: &R) -> Result<Option<Hash>, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let Some(expected) = self.history.undo() else {
            return Ok(None);
        };
        self.restore(rules, expected)?;
        Ok(Some(expected))
    }

    /// Step forward one snapshot after the host redid an edit.
    pub fn redo<R>(&mut self, rules: &R) -> Result<Option<Hash>, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let Some(expected) = self.history.redo() else {
            return Ok(None);
        };
        self.restore(rules, expected)?;
        Ok(Some(expected))
    }

    /// Re-resolve handles and rescan from the root; rebuild if that does not land on `expected`.
    fn restore<R>(&mut self, rules: &R, expected: Hash) -> Result<Hash, TreeError>
    where
        R: RuleProvider<Object = O>,
    {
        let root = self.root.ok_or(TreeError::Empty)?;
        let root_object = self.node(root)?.object.clone();
        self.refresh_volatile_refs(rules);

        let top = match self.rescan(rules, root) {
            Ok(_) => self.top_hash(),
            Err(e) => {
                warn!(error = %e, "Rescan after history move failed, rebuilding");
                self.reconstruct(rules, root_object.clone())?
            }
        };
        if top == expected {
            info!(top_hash = %hasher::display(top), position = self.history.position(), "History restored");
            return Ok(top);
        }

        warn!(
            local = %hasher::display(top),
            expected = %hasher::display(expected),
            "Host state does not match history snapshot, rebuilding"
        );
        self.reconstruct(rules, root_object)
    }
}
