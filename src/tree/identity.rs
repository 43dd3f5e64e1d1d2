//! Identity derivation and key normalization

use crate::types::Identity;
use unicode_normalization::UnicodeNormalization;

/// Separator between a membership tag and the host key.
pub const MEMBERSHIP_SEPARATOR: char = ':';

/// Separator between a collision-disambiguated identity and its numeric suffix.
pub const SUFFIX_SEPARATOR: char = '#';

/// Normalize a host key for deterministic identities
///
/// This function:
/// 1. Normalizes Unicode to NFC
/// 2. Replaces the path separator so a key can never forge an ancestor segment
pub fn normalize_key(key: &str, separator: &str) -> String {
    let normalized: String = key.nfc().collect();
    if separator.is_empty() {
        return normalized;
    }
    normalized.replace(separator, "_")
}

/// Local key = optional membership tag + normalized host key.
pub fn local_key(membership: Option<&str>, stable_key: &str, separator: &str) -> String {
    let key = normalize_key(stable_key, separator);
    match membership {
        Some(tag) if !tag.is_empty() => {
            format!("{}{}{}", normalize_key(tag, separator), MEMBERSHIP_SEPARATOR, key)
        }
        _ => key,
    }
}

/// Candidate identity before collision handling.
///
/// The parent identity already encodes its own ancestors, so appending to it
/// yields the concatenation of every ancestor identity on the discovering path.
pub fn derive(parent: Option<&Identity>, local_key: &str, separator: &str) -> Identity {
    match parent {
        Some(parent) => Identity::new(format!("{}{}{}", parent.as_str(), separator, local_key)),
        None => Identity::new(local_key.to_string()),
    }
}

/// Append an incrementing numeric suffix until `taken` reports the identity free.
///
/// Returns `None` when `max_suffix` attempts are exhausted.
pub fn disambiguate<F>(candidate: Identity, max_suffix: u32, mut taken: F) -> Option<Identity>
where
    F: FnMut(&Identity) -> bool,
{
    if !taken(&candidate) {
        return Some(candidate);
    }
    for n in 1..=max_suffix {
        let next = Identity::new(format!("{}{}{}", candidate.as_str(), SUFFIX_SEPARATOR, n));
        if !taken(&next) {
            return Some(next);
        }
    }
    None
}
