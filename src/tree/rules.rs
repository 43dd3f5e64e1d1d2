//! Host object model contracts.
//!
//! The host application owns the scene graph. The hash tree only reads it through
//! [`RuleProvider`]; replicas write repairs back through [`SceneHost`].

use crate::tree::hasher;
use crate::types::{AttrValue, Hash, VolatileRef};

/// An outgoing graph edge: the child object and the collection it was reached through.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge<O> {
    pub child: O,
    pub membership: Option<String>,
}

impl<O> Edge<O> {
    pub fn new(child: O, membership: Option<String>) -> Self {
        Self { child, membership }
    }
}

/// Read contract over the host's object model.
pub trait RuleProvider {
    /// Cheap handle to a host object.
    type Object: Clone;

    /// Stable key for the object, unique among siblings reached through one collection.
    fn stable_key(&self, object: &Self::Object) -> String;

    fn type_tag(&self, object: &Self::Object) -> String;

    fn display_name(&self, object: &Self::Object) -> Option<String>;

    /// Leaf attributes only, in the host's order.
    fn attributes(&self, object: &Self::Object) -> Vec<(String, AttrValue)>;

    /// Outgoing edges, in a stable order.
    fn edges(&self, object: &Self::Object) -> Vec<Edge<Self::Object>>;

    fn hash(&self, value: &AttrValue) -> Hash {
        hasher::hash_value(value)
    }

    /// Session-local handle, valid only until the host invalidates its memory.
    fn volatile_ref(&self, object: &Self::Object) -> VolatileRef;
}

/// Write contract used by replicas to apply changes, repairs and snapshots.
pub trait SceneHost: RuleProvider {
    fn root(&self) -> Self::Object;

    fn set_attribute(&mut self, object: &Self::Object, name: &str, value: AttrValue);

    fn remove_attribute(&mut self, object: &Self::Object, name: &str);

    /// Change the object's stable key (host-side rename).
    fn rename(&mut self, object: &Self::Object, new_key: &str);

    /// Create a detached object; it becomes reachable once linked.
    fn create_object(
        &mut self,
        key: &str,
        type_tag: &str,
        display_name: Option<&str>,
    ) -> Self::Object;

    fn link(&mut self, parent: &Self::Object, child: &Self::Object, membership: Option<&str>);

    fn unlink(&mut self, parent: &Self::Object, child: &Self::Object, membership: Option<&str>);

    /// Drop every outgoing edge of `object`.
    fn clear_edges(&mut self, object: &Self::Object);
}
