//! Manifest types for created backups.
//!
//! A manifest records what went into one backup: the components, their
//! hashes, the payload size and the live files they were read from. It is
//! written once as `backups/manifests/<backup stem>.manifest.json` and never
//! modified.

use super::payload::BackupType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub timestamp: DateTime<Utc>,
    pub system_version: String,
    pub backup_format_version: u32,
    pub backup_type: BackupType,
    /// Payload path relative to the workspace root
    pub backup_path: String,
    pub components: BTreeSet<String>,
    pub component_hashes: BTreeMap<String, String>,
    pub integrity_hash: String,
    pub total_size: u64,
    pub source_files: Vec<PathBuf>,
}

impl BackupManifest {
    pub fn includes(&self, component: &str) -> bool {
        self.components.contains(component)
    }
}
