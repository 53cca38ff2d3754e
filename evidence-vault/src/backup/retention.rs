//! Retention cleanup for backups.
//!
//! Age is judged by file modification time. A backup that a surviving
//! incremental backup names as its parent (directly or through other kept
//! links) is never deleted, however old.

use super::{BackupCreator, BackupEntry, BackupType, BACKUP_AUDIT_COMPONENT};
use crate::outcome::Diagnostics;
use crate::utils::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupCleanupReport {
    pub deleted: Vec<PathBuf>,
    /// Expired backups kept because a surviving incremental depends on them
    pub kept_for_chain: Vec<PathBuf>,
    pub diagnostics: Diagnostics,
}

impl BackupCreator {
    /// Delete backups (of `backup_type`, or of every type) whose modification
    /// time is older than `retention_days`. Each deletion is audited.
    pub fn cleanup_old_backups(
        &self,
        backup_type: Option<BackupType>,
        retention_days: u32,
    ) -> Result<BackupCleanupReport> {
        let mut report = BackupCleanupReport::default();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::days(i64::from(retention_days));

        let all = self.list_backups(None)?;
        let (mut expired, survivors): (Vec<BackupEntry>, Vec<BackupEntry>) =
            all.into_iter().partition(|entry| {
                backup_type.map_or(true, |t| t == entry.backup_type) && entry.modified < cutoff
            });

        if expired.is_empty() {
            debug!("[BACKUP] Retention: nothing older than {} days", retention_days);
            return Ok(report);
        }

        // Walk parent links outward from every survivor and rescue expired
        // backups they reach.
        let mut by_identity: HashMap<PathBuf, usize> = expired
            .iter()
            .enumerate()
            .map(|(i, e)| (identity(&e.path), i))
            .collect();
        let mut rescued: HashSet<usize> = HashSet::new();
        let mut queue: Vec<PathBuf> = survivors.iter().map(|e| e.path.clone()).collect();
        while let Some(path) = queue.pop() {
            let Some(parent_ref) = parent_reference(&path) else {
                continue;
            };
            let parent = identity(&self.ctx.layout.locate_backup(&parent_ref));
            if let Some(index) = by_identity.remove(&parent) {
                rescued.insert(index);
                queue.push(expired[index].path.clone());
            }
        }

        let mut index = 0;
        expired.retain(|entry| {
            let keep = rescued.contains(&index);
            index += 1;
            if keep {
                report.diagnostics.warn(
                    "retention",
                    format!(
                        "{} is past retention but still a parent of a kept incremental backup",
                        entry.path.display()
                    ),
                );
                report.kept_for_chain.push(entry.path.clone());
            }
            !keep
        });

        for entry in expired {
            if let Err(e) = std::fs::remove_file(&entry.path) {
                report
                    .diagnostics
                    .error("retention", format!("cannot delete {}: {e}", entry.path.display()));
                continue;
            }

            let manifest = self.ctx.layout.manifest_path_for(&entry.path);
            if manifest.exists() {
                if let Err(e) = std::fs::remove_file(&manifest) {
                    report.diagnostics.warn(
                        "retention",
                        format!("cannot delete manifest {}: {e}", manifest.display()),
                    );
                }
            }

            let age_days = (now - entry.modified).num_days();
            self.ctx.record(
                "backup_deleted",
                BACKUP_AUDIT_COMPONENT,
                json!({
                    "path": self.ctx.layout.relative(&entry.path),
                    "backup_type": entry.backup_type,
                    "age_days": age_days,
                    "retention_days": retention_days,
                    "size_bytes": entry.size_bytes,
                }),
            );
            info!("[BACKUP] Deleted {} ({} days old)", entry.path.display(), age_days);
            report.deleted.push(entry.path);
        }

        Ok(report)
    }
}

/// `metadata.parent_backup_path` of a backup file, read without validation.
fn parent_reference(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let payload: Value = serde_json::from_slice(&bytes).ok()?;
    payload
        .get("metadata")?
        .get("parent_backup_path")?
        .as_str()
        .map(str::to_string)
}

fn identity(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
