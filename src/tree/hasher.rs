//! Hash computation for scene nodes using BLAKE3
//!
//! Every hash is a BLAKE3 digest folded to its first eight bytes (little-endian)
//! so that node hashes can be combined with wrapping integer addition.

use crate::types::{AttrValue, Hash, Identity};
use blake3::Hasher;
use std::collections::BTreeMap;

// Type discriminators for value hashing.
const TYPE_NULL: u8 = 0;
const TYPE_BOOL: u8 = 1;
const TYPE_INT: u8 = 2;
const TYPE_FLOAT: u8 = 3;
const TYPE_TEXT: u8 = 4;
const TYPE_VECTOR: u8 = 5;
const TYPE_BYTES: u8 = 6;

fn fold(hasher: &Hasher) -> Hash {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Hash a leaf attribute value.
///
/// Floats hash by bit pattern, so `0.0` and `-0.0` differ and `NaN` is stable.
pub fn hash_value(value: &AttrValue) -> Hash {
    let mut hasher = Hasher::new();
    match value {
        AttrValue::Null => {
            hasher.update(&[TYPE_NULL]);
        }
        AttrValue::Bool(b) => {
            hasher.update(&[TYPE_BOOL, *b as u8]);
        }
        AttrValue::Int(i) => {
            hasher.update(&[TYPE_INT]);
            hasher.update(&i.to_be_bytes());
        }
        AttrValue::Float(f) => {
            hasher.update(&[TYPE_FLOAT]);
            hasher.update(&f.to_bits().to_be_bytes());
        }
        AttrValue::Text(s) => {
            hasher.update(&[TYPE_TEXT]);
            hasher.update(&(s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        AttrValue::Vector(v) => {
            hasher.update(&[TYPE_VECTOR]);
            hasher.update(&(v.len() as u64).to_be_bytes());
            for component in v {
                hasher.update(&component.to_bits().to_be_bytes());
            }
        }
        AttrValue::Bytes(b) => {
            hasher.update(&[TYPE_BYTES]);
            hasher.update(&(b.len() as u64).to_be_bytes());
            hasher.update(b);
        }
    }
    fold(&hasher)
}

/// Compute the own-data hash of a node
///
/// own = hash(identity_len || identity || type_tag_len || type_tag || attr_count || (name || attr_hash)*)
///
/// Attributes arrive sorted by name (BTreeMap), which keeps the result independent
/// of the order the host enumerates them in.
pub fn compute_own_hash(
    identity: &Identity,
    type_tag: &str,
    attribute_hashes: &BTreeMap<String, Hash>,
) -> Hash {
    let mut hasher = Hasher::new();

    let identity_bytes = identity.as_str().as_bytes();
    hasher.update(&(identity_bytes.len() as u64).to_be_bytes());
    hasher.update(identity_bytes);

    hasher.update(&(type_tag.len() as u64).to_be_bytes());
    hasher.update(type_tag.as_bytes());

    hasher.update(&(attribute_hashes.len() as u64).to_be_bytes());
    for (name, hash) in attribute_hashes {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(&hash.to_be_bytes());
        hasher.update(b"\n");
    }

    fold(&hasher)
}

/// Format a hash for logs and diagnostics.
pub fn display(hash: Hash) -> String {
    format!("{:016x}", hash)
}
