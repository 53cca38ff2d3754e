//! Backup payload format.
//!
//! ```text
//! {
//!   "metadata": { timestamp, system_version, backup_format_version,
//!                 backup_type, description?, parent_backup_path?,
//!                 changed_components? },
//!   "snapshot": {...}, "observations": {...},   // same value, two keys
//!   "state": {...},
//!   "config": {...},
//!   "integrity_hashes": { "<component>": "<sha256>" },
//!   "integrity_hash": "<sha256>"
//! }
//! ```
//!
//! Incremental payloads carry only the components listed in
//! `changed_components`.

use crate::integrity::{compute_component_hash, compute_payload_hash};
use crate::stores::ComponentMap;
use crate::utils::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Format written by this build.
pub const CURRENT_FORMAT_VERSION: u32 = 3;
/// Oldest format restore still understands.
pub const MIN_FORMAT_VERSION: u32 = 1;

pub const SNAPSHOT_KEY: &str = "snapshot";
/// Key older payloads used for the snapshot; still written for them.
pub const LEGACY_SNAPSHOT_KEY: &str = "observations";
pub const STATE_KEY: &str = "state";
pub const CONFIG_KEY: &str = "config";

/// Logical components in restore order.
pub const COMPONENTS: [&str; 3] = [SNAPSHOT_KEY, STATE_KEY, CONFIG_KEY];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
    Emergency,
}

impl BackupType {
    pub const ALL: [BackupType; 3] = [BackupType::Full, BackupType::Incremental, BackupType::Emergency];

    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Emergency => "emergency",
        }
    }
}

impl FromStr for BackupType {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "emergency" => Ok(BackupType::Emergency),
            other => Err(VaultError::Validation(format!("unknown backup type '{other}'"))),
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: DateTime<Utc>,
    pub system_version: String,
    pub backup_format_version: u32,
    pub backup_type: BackupType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_backup_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_components: Option<Vec<String>>,
}

impl BackupMetadata {
    pub fn new(backup_type: BackupType, timestamp: DateTime<Utc>, description: Option<&str>) -> Self {
        Self {
            timestamp,
            system_version: env!("CARGO_PKG_VERSION").to_string(),
            backup_format_version: CURRENT_FORMAT_VERSION,
            backup_type,
            description: description.map(str::to_string),
            parent_backup_path: None,
            changed_components: None,
        }
    }
}

/// Components going into one payload; `None` means "not included".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Components {
    pub snapshot: Option<ComponentMap>,
    pub state: Option<ComponentMap>,
    pub config: Option<ComponentMap>,
}

impl Components {
    pub fn get(&self, name: &str) -> Option<&ComponentMap> {
        match name {
            SNAPSHOT_KEY | LEGACY_SNAPSHOT_KEY => self.snapshot.as_ref(),
            STATE_KEY => self.state.as_ref(),
            CONFIG_KEY => self.config.as_ref(),
            _ => None,
        }
    }

    /// Keep only the named components.
    pub fn retain(&mut self, names: &[String]) {
        let keep = |name: &str| names.iter().any(|n| n == name);
        if !keep(SNAPSHOT_KEY) {
            self.snapshot = None;
        }
        if !keep(STATE_KEY) {
            self.state = None;
        }
        if !keep(CONFIG_KEY) {
            self.config = None;
        }
    }
}

/// Assembled payload plus the hashes that went into it.
#[derive(Debug, Clone)]
pub struct BuiltPayload {
    pub value: Value,
    pub component_hashes: BTreeMap<String, String>,
    pub integrity_hash: String,
}

/// Assemble a payload, hash every included component and seal it with the
/// current top-level hash scheme.
pub fn build_payload(metadata: &BackupMetadata, components: &Components) -> Result<BuiltPayload> {
    let mut object = Map::new();
    object.insert("metadata".into(), serde_json::to_value(metadata)?);

    let mut component_hashes = BTreeMap::new();
    for name in COMPONENTS {
        let Some(map) = components.get(name) else {
            continue;
        };
        let value = Value::Object(map.clone());
        component_hashes.insert(name.to_string(), compute_component_hash(name, &value)?);
        if name == SNAPSHOT_KEY {
            object.insert(LEGACY_SNAPSHOT_KEY.into(), value.clone());
        }
        object.insert(name.into(), value);
    }

    object.insert(
        "integrity_hashes".into(),
        serde_json::to_value(&component_hashes)?,
    );

    let mut value = Value::Object(object);
    let integrity_hash = compute_payload_hash(&value)?;
    value["integrity_hash"] = Value::String(integrity_hash.clone());

    Ok(BuiltPayload {
        value,
        component_hashes,
        integrity_hash,
    })
}

/// Component `name` of a raw payload, honoring the legacy snapshot key.
pub fn component_value<'a>(payload: &'a Value, name: &str) -> Option<&'a Value> {
    match name {
        SNAPSHOT_KEY | LEGACY_SNAPSHOT_KEY => payload
            .get(SNAPSHOT_KEY)
            .or_else(|| payload.get(LEGACY_SNAPSHOT_KEY)),
        other => payload.get(other),
    }
}

/// Component `name` as a map; non-object values are rejected.
pub fn component_map(payload: &Value, name: &str) -> Result<Option<ComponentMap>> {
    match component_value(payload, name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(VaultError::Validation(format!(
            "component '{name}' is not a JSON object"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::compute_hash_candidates;
    use serde_json::json;

    fn map(value: Value) -> ComponentMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_full_payload_shape() {
        let metadata = BackupMetadata::new(BackupType::Full, Utc::now(), Some("nightly"));
        let components = Components {
            snapshot: Some(map(json!({"a": 1}))),
            state: Some(map(json!({"counter": 1}))),
            config: Some(map(json!({}))),
        };

        let built = build_payload(&metadata, &components).unwrap();
        let value = &built.value;

        assert_eq!(value["snapshot"], json!({"a": 1}));
        assert_eq!(value["observations"], value["snapshot"]);
        assert_eq!(value["metadata"]["backup_type"], json!("full"));
        assert_eq!(value["metadata"]["backup_format_version"], json!(CURRENT_FORMAT_VERSION));
        assert!(value["metadata"].get("parent_backup_path").is_none());
        assert_eq!(built.component_hashes.len(), 3);
        assert_eq!(value["integrity_hash"], json!(built.integrity_hash));
        assert!(compute_hash_candidates(value).contains(&built.integrity_hash));
    }

    #[test]
    fn test_partial_payload_omits_components() {
        let mut metadata = BackupMetadata::new(BackupType::Incremental, Utc::now(), None);
        metadata.parent_backup_path = Some("backups/full/backup_20240101_000000_full.json".into());
        metadata.changed_components = Some(vec!["state".into()]);
        let components = Components {
            state: Some(map(json!({"counter": 2}))),
            ..Components::default()
        };

        let built = build_payload(&metadata, &components).unwrap();

        assert!(built.value.get("snapshot").is_none());
        assert!(built.value.get("observations").is_none());
        assert_eq!(built.value["metadata"]["changed_components"], json!(["state"]));
        assert_eq!(built.component_hashes.keys().collect::<Vec<_>>(), vec!["state"]);
    }

    #[test]
    fn test_component_value_falls_back_to_legacy_key() {
        let legacy = json!({"observations": {"a": 1}, "state": {}});
        assert_eq!(component_value(&legacy, SNAPSHOT_KEY), Some(&json!({"a": 1})));
        assert!(component_map(&json!({"state": [1]}), STATE_KEY).is_err());
        assert_eq!(component_map(&json!({}), CONFIG_KEY).unwrap(), None);
    }

    #[test]
    fn test_retain() {
        let mut components = Components {
            snapshot: Some(ComponentMap::new()),
            state: Some(ComponentMap::new()),
            config: Some(ComponentMap::new()),
        };
        components.retain(&["state".to_string()]);
        assert!(components.snapshot.is_none());
        assert!(components.state.is_some());
        assert!(components.config.is_none());
    }

    #[test]
    fn test_backup_type_parse() {
        assert_eq!("emergency".parse::<BackupType>().unwrap(), BackupType::Emergency);
        assert!("weekly".parse::<BackupType>().is_err());
    }
}
