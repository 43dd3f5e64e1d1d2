//! Core value types shared across the tree, sync and scheduling layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer hash. Aggregates are wrapping sums, so addition order never matters.
pub type Hash = u64;

/// Worker ("render node") identifier.
pub type WorkerId = String;

/// Stable, globally unique node identity.
///
/// Derived from the identities of the ancestors that first reached the node plus
/// a host-supplied local key. Safe to transmit and compare across processes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Identity(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Identity(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Identity(value)
    }
}

/// Process-lifetime-only object handle.
///
/// Used purely as a lookup key inside one running session. Never serialized,
/// never compared across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolatileRef(pub u64);

/// Leaf attribute value supplied by the host.
///
/// Container-typed data is never an attribute; it is expressed as graph edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Vector(Vec<f64>),
    Bytes(Vec<u8>),
}

impl AttrValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Null => "null",
            AttrValue::Bool(_) => "bool",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Text(_) => "text",
            AttrValue::Vector(_) => "vector",
            AttrValue::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<Vec<f64>> for AttrValue {
    fn from(value: Vec<f64>) -> Self {
        AttrValue::Vector(value)
    }
}
