//! Restore engine.
//!
//! `Validate -> Checkpoint -> Materialize -> RestoreSnapshot -> RestoreState -> Done`
//!
//! A backup that does not validate is never applied. The snapshot is the
//! primary layer: if writing it fails nothing else is attempted. A state
//! failure after the snapshot was written leaves live data mixed, and the
//! configured [`RollbackPolicy`] decides whether the checkpoint's snapshot is
//! written back or the operator is told to recover manually.

pub mod outcome;

pub use outcome::{RestorationOutcome, RestoreStage, RollbackStatus};

use crate::backup::payload::{component_map, SNAPSHOT_KEY, STATE_KEY};
use crate::backup::{BackupCreator, BackupEntry};
use crate::compat::{materialize_validated, validate_backup_file, BackupInfo};
use crate::config::RollbackPolicy;
use crate::context::VaultContext;
use crate::stores::Severity;
use crate::utils::{Result, VaultError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub const RESTORE_AUDIT_COMPONENT: &str = "restore";

/// A backup on disk with its validation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableBackup {
    pub entry: BackupEntry,
    pub valid: bool,
    pub info: Option<BackupInfo>,
    pub error: Option<String>,
}

pub struct RestoreEngine {
    ctx: Arc<VaultContext>,
    backups: BackupCreator,
}

impl RestoreEngine {
    pub fn new(ctx: Arc<VaultContext>) -> Self {
        let backups = BackupCreator::new(ctx.clone());
        Self { ctx, backups }
    }

    /// Restore live snapshot and state from the backup at `path`.
    ///
    /// Validation and chain errors are returned as `Err`; failures after
    /// live data was touched come back as an outcome with `success == false`.
    pub fn perform_restore(&self, path: &Path) -> Result<RestorationOutcome> {
        let started = Instant::now();
        let mut outcome = RestorationOutcome::new(path.to_path_buf());
        info!("[RESTORE] Restoring from {}", path.display());

        let validated = match validate_backup_file(path) {
            Ok(validated) => validated,
            Err(e) => return Err(self.abort(&mut outcome, e, started)),
        };
        info!(
            "[RESTORE] Validated {} backup (format {}, scheme {})",
            validated.info.backup_type, validated.info.format_version, validated.info.hash_scheme
        );

        outcome.advance(RestoreStage::Checkpoint);
        if self.ctx.config.restore.checkpoint {
            let checkpoint = self
                .backups
                .create_checkpoint(&format!("pre-restore checkpoint for {}", self.ctx.layout.relative(path)));
            match checkpoint.backup_path {
                Some(checkpoint_path) if checkpoint.success => {
                    info!("[RESTORE] Checkpoint written to {}", checkpoint_path.display());
                    outcome.checkpoint_path = Some(checkpoint_path);
                }
                _ => {
                    let reason: Vec<String> =
                        checkpoint.diagnostics.errors.iter().map(|d| d.to_string()).collect();
                    outcome.diagnostics.warn(
                        RestoreStage::Checkpoint.as_str(),
                        format!("checkpoint not created, continuing without one: {}", reason.join("; ")),
                    );
                }
            }
        }

        outcome.advance(RestoreStage::Materialize);
        let materialized = match materialize_validated(&self.ctx.layout, validated) {
            Ok(materialized) => materialized,
            Err(e) => return Err(self.abort(&mut outcome, e, started)),
        };
        outcome.chain_length = materialized.chain_length();

        outcome.advance(RestoreStage::RestoreSnapshot);
        if let Err(e) = self.ctx.snapshots.save(&materialized.snapshot) {
            outcome.fail(format!("snapshot restore failed: {e:#}"));
            return Ok(self.finish_failed(outcome, started));
        }
        outcome.components_restored.push(SNAPSHOT_KEY.to_string());

        outcome.advance(RestoreStage::RestoreState);
        if let Err(e) = self.ctx.state.set_current(&materialized.state) {
            outcome.fail(format!("state restore failed after snapshot was restored: {e:#}"));
            outcome.rollback = self.roll_back(outcome.checkpoint_path.clone());
            return Ok(self.finish_failed(outcome, started));
        }
        outcome.components_restored.push(STATE_KEY.to_string());

        outcome.advance(RestoreStage::Done);
        outcome.success = true;
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        self.ctx.record(
            "restore_completed",
            RESTORE_AUDIT_COMPONENT,
            json!({
                "backup_path": self.ctx.layout.relative(path),
                "backup_type": materialized.head.backup_type,
                "integrity_hash": materialized.head.integrity_hash,
                "duration_ms": outcome.duration_ms,
                "components_restored": outcome.components_restored.len(),
                "chain_length": outcome.chain_length,
                "checkpoint_path": outcome.checkpoint_path.as_deref().map(|p| self.ctx.layout.relative(p)),
                "warnings": outcome.diagnostics.warnings.len(),
            }),
        );
        info!(
            "[RESTORE] Restore from {} completed in {} ms",
            path.display(),
            outcome.duration_ms
        );
        Ok(outcome)
    }

    /// Every backup on disk, newest first, each validated but none applied.
    pub fn list_available_backups(&self) -> Result<Vec<AvailableBackup>> {
        let entries = self.backups.list_backups(None)?;
        Ok(entries
            .into_iter()
            .map(|entry| match validate_backup_file(&entry.path) {
                Ok(validated) => AvailableBackup {
                    entry,
                    valid: true,
                    info: Some(validated.info),
                    error: None,
                },
                Err(e) => AvailableBackup {
                    entry,
                    valid: false,
                    info: None,
                    error: Some(e.to_string()),
                },
            })
            .collect())
    }

    pub fn get_backup_info(&self, path: &Path) -> Result<BackupInfo> {
        validate_backup_file(path).map(|validated| validated.info)
    }

    fn roll_back(&self, checkpoint: Option<PathBuf>) -> RollbackStatus {
        let status = match (self.ctx.config.restore.rollback, checkpoint) {
            (RollbackPolicy::Automatic, Some(checkpoint)) => match self.reapply_checkpoint(&checkpoint) {
                Ok(()) => RollbackStatus::RolledBack { checkpoint },
                Err(e) => RollbackStatus::RollbackFailed {
                    checkpoint,
                    error: e.to_string(),
                },
            },
            (_, checkpoint) => RollbackStatus::ManualRecoveryRequired { checkpoint },
        };

        let message = match &status {
            RollbackStatus::RolledBack { checkpoint } => format!(
                "state restore failed; snapshot rolled back from checkpoint {}",
                checkpoint.display()
            ),
            RollbackStatus::RollbackFailed { checkpoint, error } => format!(
                "state restore failed and rollback from {} failed ({error}); live data is inconsistent",
                checkpoint.display()
            ),
            RollbackStatus::ManualRecoveryRequired { checkpoint: Some(checkpoint) } => format!(
                "state restore failed; live data is inconsistent, restore checkpoint {} manually",
                checkpoint.display()
            ),
            RollbackStatus::ManualRecoveryRequired { checkpoint: None } => {
                "state restore failed; live data is inconsistent and no checkpoint exists".to_string()
            }
            RollbackStatus::NotNeeded => return status,
        };
        error!("[RESTORE] {}", message);
        self.ctx.errors.log_error(&message, Severity::Critical);
        self.ctx.record(
            "restore_rollback",
            RESTORE_AUDIT_COMPONENT,
            serde_json::to_value(&status).unwrap_or_default(),
        );
        status
    }

    fn reapply_checkpoint(&self, checkpoint: &Path) -> Result<()> {
        let validated = validate_backup_file(checkpoint)?;
        let snapshot = component_map(&validated.payload, SNAPSHOT_KEY)?
            .ok_or_else(|| VaultError::MissingField(SNAPSHOT_KEY.into()))?;
        self.ctx.snapshots.save(&snapshot).map_err(|e| VaultError::Collection {
            component: SNAPSHOT_KEY.into(),
            message: format!("{e:#}"),
        })?;
        warn!("[RESTORE] Snapshot rolled back from {}", checkpoint.display());
        Ok(())
    }

    fn abort(&self, outcome: &mut RestorationOutcome, err: VaultError, started: Instant) -> VaultError {
        let stage = outcome.stage;
        outcome.fail(err.to_string());
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        self.audit_failure(outcome, stage);
        err
    }

    fn finish_failed(&self, mut outcome: RestorationOutcome, started: Instant) -> RestorationOutcome {
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        let stage = outcome
            .diagnostics
            .errors
            .last()
            .and_then(|d| stage_from_str(&d.step))
            .unwrap_or(RestoreStage::Failed);
        self.audit_failure(&outcome, stage);
        outcome
    }

    fn audit_failure(&self, outcome: &RestorationOutcome, stage: RestoreStage) {
        let errors: Vec<String> = outcome.diagnostics.errors.iter().map(|d| d.message.clone()).collect();
        self.ctx.errors.log_error(
            &format!(
                "restore from {} failed at {}: {}",
                outcome.backup_path.display(),
                stage,
                errors.join("; ")
            ),
            Severity::Error,
        );
        self.ctx.record(
            "restore_failed",
            RESTORE_AUDIT_COMPONENT,
            json!({
                "backup_path": self.ctx.layout.relative(&outcome.backup_path),
                "stage": stage,
                "errors": errors,
                "checkpoint_path": outcome.checkpoint_path.as_deref().map(|p| self.ctx.layout.relative(p)),
                "rollback": outcome.rollback,
                "duration_ms": outcome.duration_ms,
            }),
        );
    }
}

fn stage_from_str(step: &str) -> Option<RestoreStage> {
    [
        RestoreStage::Validate,
        RestoreStage::Checkpoint,
        RestoreStage::Materialize,
        RestoreStage::RestoreSnapshot,
        RestoreStage::RestoreState,
    ]
    .into_iter()
    .find(|s| s.as_str() == step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::backup::BackupType;
    use crate::config::VaultConfig;
    use crate::stores::{ComponentMap, MemoryComponent, MemoryErrorSink};
    use serde_json::Value;
    use tempfile::TempDir;

    fn map(value: Value) -> ComponentMap {
        value.as_object().cloned().unwrap_or_default()
    }

    struct Fixture {
        _dir: TempDir,
        ctx: Arc<VaultContext>,
        snapshot: Arc<MemoryComponent>,
        state: Arc<MemoryComponent>,
        errors: Arc<MemoryErrorSink>,
    }

    fn fixture(policy: RollbackPolicy) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = VaultConfig::for_root(dir.path());
        config.restore.rollback = policy;
        let snapshot = Arc::new(MemoryComponent::new(map(json!({"a": 1}))));
        let state = Arc::new(MemoryComponent::new(map(json!({"counter": 1}))));
        let errors = Arc::new(MemoryErrorSink::default());
        let ctx = Arc::new(VaultContext::new(
            config.clone(),
            snapshot.clone(),
            state.clone(),
            Arc::new(config),
            errors.clone(),
        ));
        Fixture {
            _dir: dir,
            ctx,
            snapshot,
            state,
            errors,
        }
    }

    #[test]
    fn test_restore_round_trip_with_checkpoint() -> Result<()> {
        let f = fixture(RollbackPolicy::Automatic);
        let backup = BackupCreator::new(f.ctx.clone())
            .perform_backup(BackupType::Full, None)
            .backup_path
            .unwrap();

        f.snapshot.replace(map(json!({"a": 99})));
        f.state.replace(map(json!({"counter": 42})));

        let outcome = RestoreEngine::new(f.ctx.clone()).perform_restore(&backup)?;
        assert!(outcome.success);
        assert_eq!(outcome.stage, RestoreStage::Done);
        assert_eq!(f.snapshot.get(), map(json!({"a": 1})));
        assert_eq!(f.state.get(), map(json!({"counter": 1})));

        let checkpoint = outcome.checkpoint_path.unwrap();
        let info = RestoreEngine::new(f.ctx.clone()).get_backup_info(&checkpoint)?;
        assert_eq!(info.backup_type, BackupType::Emergency);

        let done = f.ctx.audit.query_audit_events(
            &AuditQuery::component(RESTORE_AUDIT_COMPONENT).with_action("restore_completed"),
        )?;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].metadata["components_restored"], json!(2));
        Ok(())
    }

    #[test]
    fn test_invalid_backup_is_never_applied() -> Result<()> {
        let f = fixture(RollbackPolicy::Automatic);
        let backup = BackupCreator::new(f.ctx.clone())
            .perform_backup(BackupType::Full, None)
            .backup_path
            .unwrap();
        let text = std::fs::read_to_string(&backup)?.replace("\"a\": 1", "\"a\": 2");
        std::fs::write(&backup, text)?;
        f.snapshot.replace(map(json!({"live": true})));

        let err = RestoreEngine::new(f.ctx.clone()).perform_restore(&backup);
        assert!(matches!(err, Err(VaultError::HashMismatch { .. })));
        assert_eq!(f.snapshot.get(), map(json!({"live": true})));

        let failed = f.ctx.audit.query_audit_events(
            &AuditQuery::component(RESTORE_AUDIT_COMPONENT).with_action("restore_failed"),
        )?;
        assert_eq!(failed.len(), 1);
        Ok(())
    }

    #[test]
    fn test_snapshot_failure_stops_before_state() -> Result<()> {
        let f = fixture(RollbackPolicy::Automatic);
        let backup = BackupCreator::new(f.ctx.clone())
            .perform_backup(BackupType::Full, None)
            .backup_path
            .unwrap();
        f.state.replace(map(json!({"counter": 5})));
        f.snapshot.set_fail_writes(true);

        let outcome = RestoreEngine::new(f.ctx.clone()).perform_restore(&backup)?;
        assert!(!outcome.success);
        assert_eq!(outcome.stage, RestoreStage::Failed);
        assert!(outcome.components_restored.is_empty());
        assert_eq!(f.state.get(), map(json!({"counter": 5})));
        Ok(())
    }

    #[test]
    fn test_state_failure_rolls_back_snapshot() -> Result<()> {
        let f = fixture(RollbackPolicy::Automatic);
        let backup = BackupCreator::new(f.ctx.clone())
            .perform_backup(BackupType::Full, None)
            .backup_path
            .unwrap();
        f.snapshot.replace(map(json!({"a": 7})));
        f.state.set_fail_writes(true);

        let outcome = RestoreEngine::new(f.ctx.clone()).perform_restore(&backup)?;
        assert!(!outcome.success);
        assert!(matches!(outcome.rollback, RollbackStatus::RolledBack { .. }));
        assert_eq!(f.snapshot.get(), map(json!({"a": 7})));
        assert!(f
            .errors
            .entries()
            .iter()
            .any(|(_, severity)| *severity == Severity::Critical));
        Ok(())
    }

    #[test]
    fn test_manual_policy_reports_checkpoint() -> Result<()> {
        let f = fixture(RollbackPolicy::Manual);
        let backup = BackupCreator::new(f.ctx.clone())
            .perform_backup(BackupType::Full, None)
            .backup_path
            .unwrap();
        f.snapshot.replace(map(json!({"a": 7})));
        f.state.set_fail_writes(true);

        let outcome = RestoreEngine::new(f.ctx.clone()).perform_restore(&backup)?;
        assert_eq!(
            outcome.rollback,
            RollbackStatus::ManualRecoveryRequired {
                checkpoint: outcome.checkpoint_path.clone()
            }
        );
        assert_eq!(f.snapshot.get(), map(json!({"a": 1})));
        Ok(())
    }

    #[test]
    fn test_list_available_backups_flags_invalid() -> Result<()> {
        let f = fixture(RollbackPolicy::Automatic);
        let creator = BackupCreator::new(f.ctx.clone());
        creator.perform_backup(BackupType::Full, None);
        let bad = f.ctx.layout.backup_dir(BackupType::Full).join("backup_20200101_000000_full.json");
        std::fs::write(&bad, "{not json")?;

        let available = RestoreEngine::new(f.ctx.clone()).list_available_backups()?;
        assert_eq!(available.len(), 2);
        assert_eq!(available.iter().filter(|b| b.valid).count(), 1);
        Ok(())
    }
}
