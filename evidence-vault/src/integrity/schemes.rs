//! Every convention ever used to compute a backup's top-level
//! `integrity_hash`.
//!
//! The list is append-only: a scheme stays here for as long as backups
//! written under it may exist, otherwise those backups stop validating.

use super::hash_value;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashScheme {
    /// Format 1: only the observation content and the state
    ContentV1,
    /// Format 2: whole payload except `integrity_hash`
    PayloadV2,
    /// Format 3: whole payload except `integrity_hash` and `integrity_hashes`
    CanonicalV3,
}

impl HashScheme {
    /// Oldest first.
    pub const ALL: [HashScheme; 3] = [
        HashScheme::ContentV1,
        HashScheme::PayloadV2,
        HashScheme::CanonicalV3,
    ];

    pub const CURRENT: HashScheme = HashScheme::CanonicalV3;

    pub fn name(self) -> &'static str {
        match self {
            HashScheme::ContentV1 => "content-v1",
            HashScheme::PayloadV2 => "payload-v2",
            HashScheme::CanonicalV3 => "canonical-v3",
        }
    }

    /// Digest of `payload` under this scheme, or `None` when the payload
    /// lacks the fields the scheme covers.
    pub fn digest(self, payload: &Value) -> serde_json::Result<Option<String>> {
        let Some(object) = payload.as_object() else {
            return Ok(None);
        };

        match self {
            HashScheme::ContentV1 => {
                let snapshot = object.get("observations").or_else(|| object.get("snapshot"));
                let (Some(snapshot), Some(state)) = (snapshot, object.get("state")) else {
                    return Ok(None);
                };
                let mut covered = Map::new();
                covered.insert("observations".into(), snapshot.clone());
                covered.insert("state".into(), state.clone());
                hash_value(&Value::Object(covered)).map(Some)
            }
            HashScheme::PayloadV2 => {
                let covered = without(object, &["integrity_hash"]);
                hash_value(&covered).map(Some)
            }
            HashScheme::CanonicalV3 => {
                let covered = without(object, &["integrity_hash", "integrity_hashes"]);
                hash_value(&covered).map(Some)
            }
        }
    }
}

impl std::fmt::Display for HashScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn without(object: &Map<String, Value>, excluded: &[&str]) -> Value {
    Value::Object(
        object
            .iter()
            .filter(|(k, _)| !excluded.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "metadata": {"timestamp": "2024-01-01T00:00:00Z", "backup_type": "full"},
            "snapshot": {"a": 1},
            "observations": {"a": 1},
            "state": {"counter": 1},
            "config": {},
            "integrity_hashes": {"snapshot": "x"},
            "integrity_hash": "ignored",
        })
    }

    #[test]
    fn test_current_scheme_ignores_hash_fields() {
        let mut a = payload();
        let mut b = payload();
        a["integrity_hash"] = json!("one");
        b["integrity_hash"] = json!("two");
        b["integrity_hashes"] = json!({"snapshot": "changed"});

        assert_eq!(
            HashScheme::CanonicalV3.digest(&a).unwrap(),
            HashScheme::CanonicalV3.digest(&b).unwrap()
        );
    }

    #[test]
    fn test_payload_v2_covers_component_hashes() {
        let a = payload();
        let mut b = payload();
        b["integrity_hashes"] = json!({"snapshot": "changed"});

        assert_ne!(
            HashScheme::PayloadV2.digest(&a).unwrap(),
            HashScheme::PayloadV2.digest(&b).unwrap()
        );
    }

    #[test]
    fn test_content_v1_ignores_metadata_and_accepts_either_key() {
        let a = payload();
        let mut b = payload();
        b["metadata"] = json!({"timestamp": "1999-01-01T00:00:00Z"});
        let legacy = json!({"observations": {"a": 1}, "state": {"counter": 1}});
        let modern_key_only = json!({"snapshot": {"a": 1}, "state": {"counter": 1}});

        let digest = HashScheme::ContentV1.digest(&a).unwrap();
        assert!(digest.is_some());
        assert_eq!(digest, HashScheme::ContentV1.digest(&b).unwrap());
        assert_eq!(digest, HashScheme::ContentV1.digest(&legacy).unwrap());
        assert_eq!(digest, HashScheme::ContentV1.digest(&modern_key_only).unwrap());
    }

    #[test]
    fn test_content_v1_needs_state() {
        assert_eq!(
            HashScheme::ContentV1.digest(&json!({"snapshot": {}})).unwrap(),
            None
        );
        assert_eq!(HashScheme::CanonicalV3.digest(&json!([1, 2])).unwrap(), None);
    }

    #[test]
    fn test_schemes_are_distinct() {
        let p = payload();
        let digests: std::collections::BTreeSet<_> = HashScheme::ALL
            .iter()
            .filter_map(|s| s.digest(&p).unwrap())
            .collect();
        assert_eq!(digests.len(), HashScheme::ALL.len());
    }
}
