//! Deterministic hashing of JSON payloads.
//!
//! Payloads are serialized canonically (object keys sorted at every level,
//! no whitespace) before hashing, so two payloads that differ only in key
//! insertion order hash identically.

pub mod schemes;

pub use schemes::HashScheme;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Rebuild `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact canonical bytes of `value`.
pub fn canonical_bytes(value: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&canonicalize(value))
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash of the canonical form of `value`.
pub fn hash_value(value: &Value) -> serde_json::Result<String> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

/// Hash of one logical component, domain-separated by its name.
pub fn compute_component_hash(name: &str, value: &Value) -> serde_json::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_bytes(value)?);
    Ok(hex::encode(hasher.finalize()))
}

/// Hash of a payload under the current scheme.
pub fn compute_payload_hash(payload: &Value) -> serde_json::Result<String> {
    HashScheme::CURRENT
        .digest(payload)?
        .ok_or_else(|| serde::ser::Error::custom("payload is not a JSON object"))
}

/// Every digest any known scheme produces for `payload`.
///
/// A stored hash is trusted when it is a member of this set.
pub fn compute_hash_candidates(payload: &Value) -> BTreeSet<String> {
    HashScheme::ALL
        .iter()
        .filter_map(|scheme| scheme.digest(payload).ok().flatten())
        .collect()
}

/// The scheme that produced `stored`, if any.
pub fn matching_scheme(payload: &Value, stored: &str) -> Option<HashScheme> {
    HashScheme::ALL
        .iter()
        .copied()
        .find(|scheme| matches!(scheme.digest(payload), Ok(Some(ref d)) if d == stored))
}
