//! Backup creation.
//!
//! `BackupCreator` collects the snapshot, state and configuration from the
//! session's stores, seals them into a hashed payload and writes it through
//! the atomic writer. Every created or deleted backup is paired with an
//! audit event.

pub mod manifest;
pub mod payload;
pub mod retention;

pub use manifest::BackupManifest;
pub use payload::{BackupMetadata, BackupType, Components, CURRENT_FORMAT_VERSION};
pub use retention::BackupCleanupReport;

use crate::compat::{materialize, materialize_validated, validate_backup_file, BackupInfo};
use crate::context::VaultContext;
use crate::fs::layout::{available_space, backup_file_name, parse_backup_file_name, MANIFESTS_DIR};
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::fs::WriteMode;
use crate::integrity::compute_component_hash;
use crate::outcome::Diagnostics;
use crate::stores::{ComponentMap, Severity};
use crate::utils::Result;
use chrono::{DateTime, Utc};
use payload::{build_payload, BuiltPayload, COMPONENTS, CONFIG_KEY, SNAPSHOT_KEY, STATE_KEY};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Audit component for backup lifecycle events.
pub const BACKUP_AUDIT_COMPONENT: &str = "backup";

/// Result of one backup attempt. Returned on failure too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOutcome {
    pub success: bool,
    pub backup_type: BackupType,
    pub backup_path: Option<PathBuf>,
    pub integrity_hash: Option<String>,
    pub size_bytes: u64,
    pub manifest: Option<BackupManifest>,
    pub manifest_path: Option<PathBuf>,
    /// Components written by an incremental backup
    pub changed_components: Vec<String>,
    /// Backups removed by the retention pass that followed
    pub deleted_backups: Vec<PathBuf>,
    pub diagnostics: Diagnostics,
}

impl BackupOutcome {
    fn new(backup_type: BackupType) -> Self {
        Self {
            success: false,
            backup_type,
            backup_path: None,
            integrity_hash: None,
            size_bytes: 0,
            manifest: None,
            manifest_path: None,
            changed_components: Vec::new(),
            deleted_backups: Vec::new(),
            diagnostics: Diagnostics::default(),
        }
    }
}

/// One backup file found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub backup_type: BackupType,
    /// Creation time encoded in the file name
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupVerification {
    pub path: PathBuf,
    pub valid: bool,
    pub info: Option<BackupInfo>,
    /// Files needed to materialize the backup, itself included
    pub chain_length: usize,
    pub error: Option<String>,
}

/// Components collected from the live stores.
struct Collected {
    components: Components,
    source_files: Vec<PathBuf>,
}

pub struct BackupCreator {
    ctx: Arc<VaultContext>,
}

impl BackupCreator {
    pub fn new(ctx: Arc<VaultContext>) -> Self {
        Self { ctx }
    }

    /// Full or emergency backup of everything the stores hold.
    pub fn perform_backup(&self, backup_type: BackupType, description: Option<&str>) -> BackupOutcome {
        if backup_type == BackupType::Incremental {
            return self.perform_incremental_backup(None);
        }
        let cleanup = self.ctx.config.backup.cleanup_after_backup;
        self.run_backup(backup_type, description, cleanup)
    }

    /// Emergency backup taken before a destructive operation; never triggers
    /// retention.
    pub(crate) fn create_checkpoint(&self, reason: &str) -> BackupOutcome {
        self.run_backup(BackupType::Emergency, Some(reason), false)
    }

    /// Full backup taken before a schema migration. Retention is skipped so
    /// that no backup the migration is about to move gets deleted first.
    pub(crate) fn create_safety_backup(&self, description: &str) -> BackupOutcome {
        self.run_backup(BackupType::Full, Some(description), false)
    }

    fn run_backup(&self, backup_type: BackupType, description: Option<&str>, cleanup: bool) -> BackupOutcome {
        let mut outcome = BackupOutcome::new(backup_type);
        info!("[BACKUP] Starting {} backup", backup_type);

        if let Err(e) = self.ctx.layout.ensure_backup_dirs() {
            outcome.diagnostics.error("prepare", format!("cannot create backup directories: {e}"));
            return self.fail(outcome);
        }
        self.check_disk_space(&mut outcome.diagnostics);

        let collected = match self.collect(&mut outcome.diagnostics) {
            Some(collected) => collected,
            None => return self.fail(outcome),
        };
        check_completeness(&collected.components, &mut outcome.diagnostics);

        let metadata = BackupMetadata::new(backup_type, Utc::now(), description);
        self.seal_and_store(metadata, collected, &mut outcome);

        if outcome.success && cleanup {
            self.cleanup_after(backup_type, &mut outcome);
        }
        outcome
    }

    /// Incremental backup against the newest full or incremental backup
    /// taken at or before `since` (the newest overall when `None`).
    ///
    /// Falls back to a full backup when no usable parent exists.
    pub fn perform_incremental_backup(&self, since: Option<DateTime<Utc>>) -> BackupOutcome {
        let mut outcome = BackupOutcome::new(BackupType::Incremental);
        info!("[BACKUP] Starting incremental backup (since: {:?})", since);

        if let Err(e) = self.ctx.layout.ensure_backup_dirs() {
            outcome.diagnostics.error("prepare", format!("cannot create backup directories: {e}"));
            return self.fail(outcome);
        }

        let parent = match self.find_parent(since) {
            Some(parent) => parent,
            None => {
                let mut full = self.run_backup(
                    BackupType::Full,
                    Some("incremental fallback: no usable parent backup"),
                    self.ctx.config.backup.cleanup_after_backup,
                );
                full.diagnostics.warn(
                    "parent",
                    "no valid parent backup found; a full backup was taken instead",
                );
                return full;
            }
        };
        self.check_disk_space(&mut outcome.diagnostics);

        let mut collected = match self.collect(&mut outcome.diagnostics) {
            Some(collected) => collected,
            None => return self.fail(outcome),
        };

        let mut changed = Vec::new();
        for name in COMPONENTS {
            let current = collected.components.get(name);
            let previous = match name {
                SNAPSHOT_KEY => Some(&parent.snapshot),
                STATE_KEY => Some(&parent.state),
                _ => parent.config.as_ref(),
            };
            match (current, previous) {
                (None, _) => {}
                (Some(_), None) => changed.push(name.to_string()),
                (Some(current), Some(previous)) => {
                    match (component_digest(name, current), component_digest(name, previous)) {
                        (Ok(a), Ok(b)) if a == b => {}
                        (Ok(_), Ok(_)) => changed.push(name.to_string()),
                        (Err(e), _) | (_, Err(e)) => {
                            outcome.diagnostics.warn(
                                "hash",
                                format!("cannot compare component '{name}': {e}; storing it"),
                            );
                            changed.push(name.to_string());
                        }
                    }
                }
            }
        }
        if changed.is_empty() {
            outcome
                .diagnostics
                .warn("collect", "no components changed since the parent backup");
        }
        collected.components.retain(&changed);

        let mut metadata = BackupMetadata::new(BackupType::Incremental, Utc::now(), None);
        metadata.parent_backup_path = Some(self.ctx.layout.relative(&parent.path));
        metadata.changed_components = Some(changed.clone());
        outcome.changed_components = changed;

        self.seal_and_store(metadata, collected, &mut outcome);
        if outcome.success && self.ctx.config.backup.cleanup_after_backup {
            self.cleanup_after(BackupType::Incremental, &mut outcome);
        }
        outcome
    }

    /// Backup files on disk, newest first.
    pub fn list_backups(&self, backup_type: Option<BackupType>) -> Result<Vec<BackupEntry>> {
        let root = self.ctx.layout.backups_root();
        let files = walk_directory(&root, &WalkOptions::with_extension("json").max_depth(2))?;

        let mut entries: Vec<BackupEntry> = files
            .into_iter()
            .filter(|f| !f.relative_path.starts_with(MANIFESTS_DIR))
            .filter_map(|f| {
                let name = f.file_name();
                let Some((at, kind)) = parse_backup_file_name(&name) else {
                    debug!("[BACKUP] Ignoring non-backup file {}", f.path.display());
                    return None;
                };
                if backup_type.is_some_and(|t| t != kind) {
                    return None;
                }
                Some(BackupEntry {
                    file_name: name,
                    backup_type: kind,
                    timestamp: at.and_utc(),
                    size_bytes: f.size,
                    modified: DateTime::<Utc>::from(f.modified),
                    path: f.path,
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        Ok(entries)
    }

    /// Validate a backup and the chain it depends on, without restoring.
    pub fn verify_backup(&self, path: &Path) -> BackupVerification {
        let mut verification = BackupVerification {
            path: path.to_path_buf(),
            valid: false,
            info: None,
            chain_length: 0,
            error: None,
        };

        match materialize(&self.ctx.layout, path) {
            Ok(materialized) => {
                verification.valid = true;
                verification.chain_length = materialized.chain_length();
                verification.info = Some(materialized.head);
                info!("[BACKUP] Verified {}", path.display());
            }
            Err(e) => {
                warn!("[BACKUP] Verification of {} failed: {}", path.display(), e);
                verification.info = validate_backup_file(path).ok().map(|v| v.info);
                verification.error = Some(e.to_string());
            }
        }
        verification
    }

    fn cleanup_after(&self, backup_type: BackupType, outcome: &mut BackupOutcome) {
        let retention_days = self.ctx.config.backup.retention_days;
        match self.cleanup_old_backups(Some(backup_type), retention_days) {
            Ok(report) => {
                for issue in report.diagnostics.warnings.into_iter().chain(report.diagnostics.errors) {
                    outcome.diagnostics.warn("retention", issue.message);
                }
                outcome.deleted_backups = report.deleted;
            }
            Err(e) => outcome
                .diagnostics
                .warn("retention", format!("retention cleanup failed: {e}")),
        }
    }

    fn check_disk_space(&self, diagnostics: &mut Diagnostics) {
        let min_free = self.ctx.config.backup.min_free_bytes;
        if let Some(free) = available_space(&self.ctx.layout.backups_root()) {
            if free < min_free {
                diagnostics.warn(
                    "disk_space",
                    format!("low disk space: {} MiB free, {} MiB recommended", free >> 20, min_free >> 20),
                );
            }
        }
    }

    /// Snapshot and state are required; configuration is optional.
    fn collect(&self, diagnostics: &mut Diagnostics) -> Option<Collected> {
        let snapshot = match self.ctx.snapshots.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                diagnostics.error("collect", format!("snapshot collection failed: {e:#}"));
                return None;
            }
        };
        let state = match self.ctx.state.get_current() {
            Ok(state) => state,
            Err(e) => {
                diagnostics.error("collect", format!("state collection failed: {e:#}"));
                return None;
            }
        };
        let config = match self.ctx.config_source.get_active_config() {
            Ok(config) => Some(config),
            Err(e) => {
                diagnostics.warn("collect", format!("configuration not included: {e:#}"));
                None
            }
        };

        let mut source_files = self.ctx.snapshots.source_paths();
        source_files.extend(self.ctx.state.source_paths());

        Some(Collected {
            components: Components {
                snapshot: Some(snapshot),
                state: Some(state),
                config,
            },
            source_files,
        })
    }

    /// Hash, write, record the manifest and audit; sets `outcome.success`.
    fn seal_and_store(&self, metadata: BackupMetadata, collected: Collected, outcome: &mut BackupOutcome) {
        let backup_type = metadata.backup_type;
        let timestamp = metadata.timestamp;

        let built = match build_payload(&metadata, &collected.components) {
            Ok(built) => built,
            Err(e) => {
                outcome.diagnostics.error("hash", format!("cannot hash backup payload: {e}"));
                self.audit_failure(outcome);
                return;
            }
        };
        let bytes = match serde_json::to_vec_pretty(&built.value) {
            Ok(bytes) => bytes,
            Err(e) => {
                outcome.diagnostics.error("serialize", e.to_string());
                self.audit_failure(outcome);
                return;
            }
        };

        let path = self.unique_backup_path(backup_type, timestamp);
        match self.ctx.writer.write(&path, &bytes) {
            Ok(WriteMode::Atomic) => {}
            Ok(WriteMode::Direct) => outcome.diagnostics.warn(
                "write",
                "backup written directly after atomic rename kept failing",
            ),
            Err(e) => {
                outcome
                    .diagnostics
                    .error("write", format!("cannot write {}: {e}", path.display()));
                self.audit_failure(outcome);
                return;
            }
        }

        outcome.success = true;
        outcome.size_bytes = bytes.len() as u64;
        outcome.integrity_hash = Some(built.integrity_hash.clone());
        outcome.backup_path = Some(path.clone());

        self.write_manifest(&metadata, &built, &path, collected.source_files, outcome);

        let warnings: Vec<String> = outcome.diagnostics.warnings.iter().map(|w| w.to_string()).collect();
        self.ctx.record(
            "backup_created",
            BACKUP_AUDIT_COMPONENT,
            json!({
                "backup_type": backup_type,
                "path": self.ctx.layout.relative(&path),
                "integrity_hash": built.integrity_hash,
                "size_bytes": outcome.size_bytes,
                "parent_backup_path": metadata.parent_backup_path,
                "changed_components": metadata.changed_components,
                "warnings": warnings,
            }),
        );

        info!(
            "[BACKUP] {} backup written to {} ({} bytes, hash {})",
            backup_type,
            path.display(),
            outcome.size_bytes,
            &built.integrity_hash[..12.min(built.integrity_hash.len())]
        );
    }

    fn write_manifest(
        &self,
        metadata: &BackupMetadata,
        built: &BuiltPayload,
        path: &Path,
        source_files: Vec<PathBuf>,
        outcome: &mut BackupOutcome,
    ) {
        let manifest = BackupManifest {
            timestamp: metadata.timestamp,
            system_version: metadata.system_version.clone(),
            backup_format_version: metadata.backup_format_version,
            backup_type: metadata.backup_type,
            backup_path: self.ctx.layout.relative(path),
            components: built.component_hashes.keys().cloned().collect(),
            component_hashes: built.component_hashes.clone(),
            integrity_hash: built.integrity_hash.clone(),
            total_size: outcome.size_bytes,
            source_files,
        };

        let manifest_path = self.ctx.layout.manifest_path_for(path);
        match self.ctx.writer.write_json(&manifest_path, &manifest) {
            Ok(_) => {
                outcome.manifest_path = Some(manifest_path);
                outcome.manifest = Some(manifest);
            }
            Err(e) => {
                outcome
                    .diagnostics
                    .warn("manifest", format!("manifest not written: {e}"));
                outcome.manifest = Some(manifest);
            }
        }
    }

    /// `backup_<date>_<time>_<type>.json`, suffixed when already taken.
    fn unique_backup_path(&self, backup_type: BackupType, timestamp: DateTime<Utc>) -> PathBuf {
        let dir = self.ctx.layout.backup_dir(backup_type);
        let at = timestamp.naive_utc();
        let mut collision = 0;
        loop {
            let candidate = dir.join(backup_file_name(at, backup_type, collision));
            if !candidate.exists() {
                return candidate;
            }
            collision += 1;
        }
    }

    fn find_parent(&self, since: Option<DateTime<Utc>>) -> Option<ParentBackup> {
        let entries = match self.list_backups(None) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[BACKUP] Cannot list backups for parent lookup: {}", e);
                return None;
            }
        };

        for entry in entries {
            if entry.backup_type == BackupType::Emergency {
                continue;
            }
            let validated = match validate_backup_file(&entry.path) {
                Ok(validated) => validated,
                Err(e) => {
                    debug!("[BACKUP] Skipping invalid parent candidate {}: {}", entry.path.display(), e);
                    continue;
                }
            };
            if since.is_some_and(|since| validated.info.timestamp > since) {
                continue;
            }
            match materialize_validated(&self.ctx.layout, validated) {
                Ok(materialized) => {
                    return Some(ParentBackup {
                        path: entry.path,
                        snapshot: materialized.snapshot,
                        state: materialized.state,
                        config: materialized.config,
                    })
                }
                Err(e) => {
                    warn!("[BACKUP] Parent candidate {} has a broken chain: {}", entry.path.display(), e);
                    return None;
                }
            }
        }
        None
    }

    fn fail(&self, outcome: BackupOutcome) -> BackupOutcome {
        self.audit_failure(&outcome);
        outcome
    }

    fn audit_failure(&self, outcome: &BackupOutcome) {
        let errors: Vec<String> = outcome.diagnostics.errors.iter().map(|e| e.to_string()).collect();
        error!("[BACKUP] {} backup failed: {}", outcome.backup_type, errors.join("; "));
        self.ctx.errors.log_error(
            &format!("{} backup failed: {}", outcome.backup_type, errors.join("; ")),
            Severity::Error,
        );
        self.ctx.record(
            "backup_failed",
            BACKUP_AUDIT_COMPONENT,
            json!({ "backup_type": outcome.backup_type, "errors": errors }),
        );
    }
}

struct ParentBackup {
    path: PathBuf,
    snapshot: ComponentMap,
    state: ComponentMap,
    config: Option<ComponentMap>,
}

fn component_digest(name: &str, map: &ComponentMap) -> serde_json::Result<String> {
    compute_component_hash(name, &Value::Object(map.clone()))
}

/// Thin backups are written but flagged.
fn check_completeness(components: &Components, diagnostics: &mut Diagnostics) {
    for (name, map) in [
        (SNAPSHOT_KEY, components.snapshot.as_ref()),
        (STATE_KEY, components.state.as_ref()),
        (CONFIG_KEY, components.config.as_ref()),
    ] {
        match map {
            Some(map) if map.is_empty() => {
                diagnostics.warn("completeness", format!("component '{name}' is empty"))
            }
            None if name != CONFIG_KEY => {
                diagnostics.warn("completeness", format!("component '{name}' is missing"))
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::config::VaultConfig;
    use crate::stores::{MemoryComponent, MemoryErrorSink};
    use tempfile::TempDir;

    fn map(value: Value) -> ComponentMap {
        value.as_object().cloned().unwrap_or_default()
    }

    struct Fixture {
        _dir: TempDir,
        ctx: Arc<VaultContext>,
        snapshot: Arc<MemoryComponent>,
        state: Arc<MemoryComponent>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig::for_root(dir.path());
        let snapshot = Arc::new(MemoryComponent::new(map(json!({"a": 1}))));
        let state = Arc::new(MemoryComponent::new(map(json!({"counter": 1}))));
        let config_source = Arc::new(config.clone());
        let ctx = Arc::new(VaultContext::new(
            config,
            snapshot.clone(),
            state.clone(),
            config_source,
            Arc::new(MemoryErrorSink::default()),
        ));
        Fixture {
            _dir: dir,
            ctx,
            snapshot,
            state,
        }
    }

    #[test]
    fn test_full_backup_writes_payload_manifest_and_audit() -> Result<()> {
        let f = fixture();
        let creator = BackupCreator::new(f.ctx.clone());

        let outcome = creator.perform_backup(BackupType::Full, Some("first"));
        assert!(outcome.success, "{:?}", outcome.diagnostics);

        let path = outcome.backup_path.clone().unwrap();
        assert!(path.starts_with(f.ctx.layout.backup_dir(BackupType::Full)));
        let validated = validate_backup_file(&path)?;
        assert_eq!(validated.info.description.as_deref(), Some("first"));
        assert_eq!(Some(validated.info.integrity_hash), outcome.integrity_hash);

        let manifest_path = outcome.manifest_path.unwrap();
        assert!(manifest_path.exists());
        assert!(outcome.manifest.unwrap().includes("snapshot"));

        let events = f.ctx.audit.query_audit_events(
            &AuditQuery::component(BACKUP_AUDIT_COMPONENT).with_action("backup_created"),
        )?;
        assert_eq!(events.len(), 1);
        Ok(())
    }

    #[test]
    fn test_collection_failure_writes_nothing() -> Result<()> {
        let f = fixture();
        f.state.set_fail_reads(true);
        let creator = BackupCreator::new(f.ctx.clone());

        let outcome = creator.perform_backup(BackupType::Full, None);
        assert!(!outcome.success);
        assert!(outcome.backup_path.is_none());
        assert!(outcome.diagnostics.has_errors());
        assert!(creator.list_backups(None)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_same_second_backups_get_distinct_names() -> Result<()> {
        let f = fixture();
        let creator = BackupCreator::new(f.ctx.clone());

        let a = creator.perform_backup(BackupType::Full, None);
        let b = creator.perform_backup(BackupType::Full, None);
        assert_ne!(a.backup_path, b.backup_path);
        assert_eq!(creator.list_backups(Some(BackupType::Full))?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_incremental_stores_only_changed_components() -> Result<()> {
        let f = fixture();
        let creator = BackupCreator::new(f.ctx.clone());
        let full = creator.perform_backup(BackupType::Full, None);
        assert!(full.success);

        f.state.replace(map(json!({"counter": 2})));
        let inc = creator.perform_incremental_backup(None);
        assert!(inc.success, "{:?}", inc.diagnostics);
        assert_eq!(inc.backup_type, BackupType::Incremental);
        assert_eq!(inc.changed_components, vec!["state"]);

        let merged = materialize(&f.ctx.layout, &inc.backup_path.unwrap())?;
        assert_eq!(Value::Object(merged.snapshot), json!({"a": 1}));
        assert_eq!(Value::Object(merged.state), json!({"counter": 2}));
        assert_eq!(merged.chain.len(), 2);
        Ok(())
    }

    #[test]
    fn test_incremental_without_parent_falls_back_to_full() {
        let f = fixture();
        let creator = BackupCreator::new(f.ctx.clone());

        let outcome = creator.perform_incremental_backup(None);
        assert!(outcome.success);
        assert_eq!(outcome.backup_type, BackupType::Full);
        assert!(outcome.diagnostics.warnings.iter().any(|w| w.step == "parent"));
    }

    #[test]
    fn test_empty_components_warn() {
        let f = fixture();
        f.snapshot.replace(ComponentMap::new());
        let creator = BackupCreator::new(f.ctx.clone());

        let outcome = creator.perform_backup(BackupType::Full, None);
        assert!(outcome.success);
        assert!(outcome
            .diagnostics
            .warnings
            .iter()
            .any(|w| w.step == "completeness" && w.message.contains("snapshot")));
    }

    #[test]
    fn test_verify_detects_tampering() -> Result<()> {
        let f = fixture();
        let creator = BackupCreator::new(f.ctx.clone());
        let path = creator.perform_backup(BackupType::Full, None).backup_path.unwrap();
        assert!(creator.verify_backup(&path).valid);

        let text = std::fs::read_to_string(&path)?.replace("\"counter\": 1", "\"counter\": 7");
        std::fs::write(&path, text)?;
        let verification = creator.verify_backup(&path);
        assert!(!verification.valid);
        assert!(verification.error.is_some());
        Ok(())
    }
}
