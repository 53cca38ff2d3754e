//! Incremental chain resolution.
//!
//! A chain is walked head-first with an explicit loop, collecting each
//! validated backup until a full (or emergency) base is reached, then merged
//! base-first so every child overrides only its `changed_components`.

use super::validate::{validate_backup_file, BackupInfo, ValidatedBackup};
use crate::backup::payload::{component_map, BackupType, CONFIG_KEY, SNAPSHOT_KEY, STATE_KEY};
use crate::fs::StorageLayout;
use crate::stores::ComponentMap;
use crate::utils::{Result, VaultError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// A chain merged into the equivalent of one full backup.
#[derive(Debug, Clone)]
pub struct MaterializedBackup {
    pub snapshot: ComponentMap,
    pub state: ComponentMap,
    pub config: Option<ComponentMap>,
    /// Backup files from head to base
    pub chain: Vec<PathBuf>,
    pub head: BackupInfo,
}

impl MaterializedBackup {
    pub fn chain_length(&self) -> usize {
        self.chain.len()
    }
}

/// Resolve the backup at `head` (and any parents) into full component values.
pub fn materialize(layout: &StorageLayout, head: &Path) -> Result<MaterializedBackup> {
    let first = validate_backup_file(head)?;
    materialize_validated(layout, first)
}

pub fn materialize_validated(layout: &StorageLayout, head: ValidatedBackup) -> Result<MaterializedBackup> {
    let mut visited: HashSet<PathBuf> = HashSet::new();
    visited.insert(identity(&head.path));

    let head_info = head.info.clone();
    let mut links = vec![head];

    loop {
        let Some(current) = links.last() else {
            break;
        };
        if current.info.backup_type != BackupType::Incremental {
            break;
        }
        let Some(parent_ref) = current.info.parent_backup_path.clone() else {
            return Err(VaultError::MissingField("metadata.parent_backup_path".into()));
        };
        let parent_path = layout.locate_backup(&parent_ref);
        if !visited.insert(identity(&parent_path)) {
            tracing::error!("[RESTORE] Incremental chain loops back to {}", parent_path.display());
            return Err(VaultError::ChainCycle(parent_path));
        }
        let parent = match validate_backup_file(&parent_path) {
            Ok(parent) => parent,
            Err(VaultError::BackupNotFound(p)) => return Err(VaultError::ParentMissing(p)),
            Err(e) => return Err(e),
        };
        tracing::debug!("[RESTORE] Chain link {} -> {}", current.path.display(), parent_path.display());
        links.push(parent);
    }

    let mut snapshot: Option<ComponentMap> = None;
    let mut state: Option<ComponentMap> = None;
    let mut config: Option<ComponentMap> = None;

    for link in links.iter().rev() {
        let overrides: Vec<&str> = match link.info.backup_type {
            BackupType::Incremental => link.info.changed_components.iter().map(String::as_str).collect(),
            BackupType::Full | BackupType::Emergency => vec![SNAPSHOT_KEY, STATE_KEY, CONFIG_KEY],
        };
        for name in overrides {
            let value = component_map(&link.payload, name)?;
            match name {
                STATE_KEY => state = value.or(state),
                CONFIG_KEY => config = value.or(config),
                _ => snapshot = value.or(snapshot),
            }
        }
    }

    let base = links.last().map(|l| l.path.clone()).unwrap_or_default();
    let snapshot = snapshot.ok_or_else(|| {
        VaultError::Validation(format!("chain base {} carries no snapshot", base.display()))
    })?;
    let state = state.ok_or_else(|| {
        VaultError::Validation(format!("chain base {} carries no state", base.display()))
    })?;

    Ok(MaterializedBackup {
        snapshot,
        state,
        config,
        chain: links.into_iter().map(|l| l.path).collect(),
        head: head_info,
    })
}

fn identity(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
