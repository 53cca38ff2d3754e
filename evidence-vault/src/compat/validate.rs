//! Structural and cryptographic validation of backup files, across every
//! payload format still understood.

use crate::backup::payload::{
    component_value, BackupType, COMPONENTS, CONFIG_KEY, CURRENT_FORMAT_VERSION,
    LEGACY_SNAPSHOT_KEY, MIN_FORMAT_VERSION, SNAPSHOT_KEY, STATE_KEY,
};
use crate::integrity::{compute_component_hash, compute_hash_candidates, matching_scheme};
use crate::utils::{Result, VaultError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// What a backup declares about itself, once it has validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub backup_type: BackupType,
    pub timestamp: DateTime<Utc>,
    pub format_version: u32,
    pub system_version: Option<String>,
    pub description: Option<String>,
    pub parent_backup_path: Option<String>,
    /// Components this payload carries values for
    pub components: Vec<String>,
    /// For incremental backups: components overriding the parent
    pub changed_components: Vec<String>,
    pub integrity_hash: String,
    /// Name of the hash scheme the stored hash matched
    pub hash_scheme: String,
    pub size_bytes: u64,
}

/// A backup that passed validation, with its parsed payload.
#[derive(Debug, Clone)]
pub struct ValidatedBackup {
    pub path: PathBuf,
    pub payload: Value,
    pub info: BackupInfo,
}

/// Read and validate the backup at `path` without touching live storage.
pub fn validate_backup_file(path: &Path) -> Result<ValidatedBackup> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VaultError::BackupNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let payload: Value = serde_json::from_slice(&bytes)?;
    validate_backup_payload(path, payload, bytes.len() as u64)
}

pub fn validate_backup_payload(path: &Path, payload: Value, size_bytes: u64) -> Result<ValidatedBackup> {
    if !payload.is_object() {
        return Err(VaultError::Validation(format!(
            "{} is not a JSON object",
            path.display()
        )));
    }

    let metadata = payload
        .get("metadata")
        .filter(|m| m.is_object())
        .ok_or_else(|| VaultError::MissingField("metadata".into()))?;
    let stored_hash = payload
        .get("integrity_hash")
        .and_then(Value::as_str)
        .ok_or_else(|| VaultError::MissingField("integrity_hash".into()))?
        .to_string();

    let raw_timestamp = metadata
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| VaultError::MissingField("metadata.timestamp".into()))?;
    let timestamp = parse_timestamp(raw_timestamp).ok_or_else(|| {
        VaultError::Validation(format!("unparseable backup timestamp '{raw_timestamp}'"))
    })?;

    let format_version = match metadata.get("backup_format_version") {
        None | Some(Value::Null) => MIN_FORMAT_VERSION,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| VaultError::Validation(format!("invalid backup_format_version {v}")))?,
    };
    if !(MIN_FORMAT_VERSION..=CURRENT_FORMAT_VERSION).contains(&format_version) {
        return Err(VaultError::UnsupportedFormat {
            found: format_version,
            min: MIN_FORMAT_VERSION,
            max: CURRENT_FORMAT_VERSION,
        });
    }

    let backup_type = match metadata.get("backup_type").and_then(Value::as_str) {
        Some(raw) => raw.parse::<BackupType>()?,
        None => BackupType::Full,
    };

    if let (Some(current), Some(legacy)) = (payload.get(SNAPSHOT_KEY), payload.get(LEGACY_SNAPSHOT_KEY)) {
        if current != legacy {
            return Err(VaultError::Validation(format!(
                "payload carries both '{SNAPSHOT_KEY}' and '{LEGACY_SNAPSHOT_KEY}' with different values"
            )));
        }
    }

    let components: Vec<String> = COMPONENTS
        .iter()
        .filter(|name| component_value(&payload, name).is_some_and(|v| !v.is_null()))
        .map(|name| name.to_string())
        .collect();

    let parent_backup_path = metadata
        .get("parent_backup_path")
        .and_then(Value::as_str)
        .map(str::to_string);

    let changed_components = match backup_type {
        BackupType::Incremental => {
            if parent_backup_path.is_none() {
                return Err(VaultError::MissingField("metadata.parent_backup_path".into()));
            }
            let changed = match metadata.get("changed_components") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|i| {
                        i.as_str().map(str::to_string).ok_or_else(|| {
                            VaultError::Validation("changed_components must be strings".into())
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
                _ => components.clone(),
            };
            for name in &changed {
                let known = COMPONENTS.contains(&name.as_str()) || name == LEGACY_SNAPSHOT_KEY;
                if !known {
                    return Err(VaultError::Validation(format!("unknown changed component '{name}'")));
                }
                if component_value(&payload, name).is_none() {
                    return Err(VaultError::MissingField(name.clone()));
                }
            }
            changed
        }
        BackupType::Full | BackupType::Emergency => {
            if payload.get(STATE_KEY).is_none() {
                return Err(VaultError::MissingField(STATE_KEY.into()));
            }
            if component_value(&payload, SNAPSHOT_KEY).is_none() {
                return Err(VaultError::MissingField(format!(
                    "{SNAPSHOT_KEY} (or {LEGACY_SNAPSHOT_KEY})"
                )));
            }
            Vec::new()
        }
    };

    let candidates = compute_hash_candidates(&payload);
    if !candidates.contains(&stored_hash) {
        return Err(VaultError::HashMismatch {
            stored: stored_hash,
            candidates: candidates.len(),
        });
    }
    let hash_scheme = matching_scheme(&payload, &stored_hash)
        .map(|s| s.name().to_string())
        .unwrap_or_default();

    if format_version == CURRENT_FORMAT_VERSION {
        verify_component_hashes(&payload)?;
    }

    let info = BackupInfo {
        path: path.to_path_buf(),
        backup_type,
        timestamp,
        format_version,
        system_version: metadata
            .get("system_version")
            .and_then(Value::as_str)
            .map(str::to_string),
        description: metadata
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        parent_backup_path,
        components,
        changed_components,
        integrity_hash: stored_hash,
        hash_scheme,
        size_bytes,
    };

    Ok(ValidatedBackup {
        path: path.to_path_buf(),
        payload,
        info,
    })
}

/// Per-component hashes of current-format payloads must match their data.
fn verify_component_hashes(payload: &Value) -> Result<()> {
    let Some(hashes) = payload.get("integrity_hashes").and_then(Value::as_object) else {
        return Ok(());
    };
    for name in [SNAPSHOT_KEY, STATE_KEY, CONFIG_KEY] {
        let (Some(expected), Some(value)) = (
            hashes.get(name).and_then(Value::as_str),
            component_value(payload, name),
        ) else {
            continue;
        };
        let actual = compute_component_hash(name, value)?;
        if actual != expected {
            return Err(VaultError::HashMismatch {
                stored: format!("{name}:{expected}"),
                candidates: 1,
            });
        }
    }
    Ok(())
}

/// RFC 3339 with any offset, or a naive ISO timestamp taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y%m%d_%H%M%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
