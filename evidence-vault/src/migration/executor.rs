//! Runs migration paths against a workspace.

use super::registry::{Condition, MigrationRegistry, MigrationStep, RegisteredStep, StepContext};
use super::version::{detect_version, write_version_marker, SchemaVersion};
use crate::backup::BackupCreator;
use crate::context::VaultContext;
use crate::outcome::Diagnostics;
use crate::stores::Severity;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub const MIGRATION_AUDIT_COMPONENT: &str = "migration";

/// Asked once per step flagged `requires_confirmation`; `false` declines.
pub type ConfirmFn<'a> = &'a dyn Fn(&MigrationStep) -> bool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    pub success: bool,
    pub dry_run: bool,
    pub from_version: Option<SchemaVersion>,
    pub target_version: Option<SchemaVersion>,
    /// Version the workspace is at when the run ended
    pub reached_version: Option<SchemaVersion>,
    pub steps_planned: Vec<String>,
    pub steps_completed: Vec<String>,
    /// Idempotent steps whose postconditions already held
    pub steps_skipped: Vec<String>,
    /// Safety backup; never set by a dry run
    pub backup_path: Option<PathBuf>,
    pub duration_ms: u64,
    pub diagnostics: Diagnostics,
}

impl MigrationResult {
    fn new(dry_run: bool) -> Self {
        Self {
            success: false,
            dry_run,
            from_version: None,
            target_version: None,
            reached_version: None,
            steps_planned: Vec::new(),
            steps_completed: Vec::new(),
            steps_skipped: Vec::new(),
            backup_path: None,
            duration_ms: 0,
            diagnostics: Diagnostics::default(),
        }
    }
}

pub struct MigrationExecutor {
    ctx: Arc<VaultContext>,
    registry: MigrationRegistry,
}

impl MigrationExecutor {
    pub fn new(ctx: Arc<VaultContext>, registry: MigrationRegistry) -> Self {
        Self { ctx, registry }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Move the workspace to `target`.
    ///
    /// Confirmations are collected before anything is written. With
    /// `create_backup` a full backup is taken first and its failure aborts
    /// the run. Steps run in order and the run stops at the first failing
    /// precondition, action or postcondition; completed steps stay applied
    /// and `version.txt` records the last of them.
    pub fn migrate(&self, target: &str, create_backup: bool, confirm: Option<ConfirmFn<'_>>) -> MigrationResult {
        let started = Instant::now();
        let mut result = MigrationResult::new(false);

        let Some((from, to, path)) = self.plan(target, &mut result) else {
            return self.finish(result, started);
        };
        if path.is_empty() {
            info!("[MIGRATION] Workspace already at {}", to);
            result.success = true;
            result.reached_version = Some(from);
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }
        info!(
            "[MIGRATION] Migrating {} -> {} in {} step(s)",
            from,
            to,
            path.len()
        );

        for planned in path.iter().filter(|p| p.step.requires_confirmation) {
            let accepted = confirm.is_some_and(|confirm| confirm(&planned.step));
            if !accepted {
                result.diagnostics.error(
                    "confirm",
                    format!(
                        "step {} ({}) requires confirmation and was declined",
                        planned.label(),
                        planned.step.description
                    ),
                );
                return self.finish(result, started);
            }
        }

        if create_backup {
            let backup = BackupCreator::new(self.ctx.clone())
                .create_safety_backup(&format!("pre-migration backup {from} -> {to}"));
            match backup.backup_path {
                Some(backup_path) if backup.success => {
                    info!("[MIGRATION] Safety backup at {}", backup_path.display());
                    result.backup_path = Some(backup_path);
                }
                _ => {
                    result.diagnostics.extend(backup.diagnostics);
                    result
                        .diagnostics
                        .error("backup", "safety backup failed; migration not attempted");
                    return self.finish(result, started);
                }
            }
        }

        let step_ctx = StepContext {
            layout: &self.ctx.layout,
            writer: &self.ctx.writer,
        };
        for planned in &path {
            let label = planned.label();
            match self.apply_step(planned, &step_ctx, &mut result) {
                StepResult::Applied => result.steps_completed.push(label.clone()),
                StepResult::Skipped => result.steps_skipped.push(label.clone()),
                StepResult::Failed => {
                    self.ctx.record(
                        "migration_step_failed",
                        MIGRATION_AUDIT_COMPONENT,
                        json!({
                            "step": label,
                            "description": planned.step.description,
                            "errors": result.diagnostics.errors.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
                        }),
                    );
                    return self.finish(result, started);
                }
            }

            if let Err(e) = write_version_marker(&self.ctx.layout, &self.ctx.writer, planned.to) {
                result
                    .diagnostics
                    .error(&label, format!("step applied but version marker not written: {e}"));
                return self.finish(result, started);
            }
            result.reached_version = Some(planned.to);
            self.ctx.record(
                "migration_step_applied",
                MIGRATION_AUDIT_COMPONENT,
                json!({
                    "step": label,
                    "description": planned.step.description,
                    "skipped": result.steps_skipped.contains(&label),
                }),
            );
        }

        result.success = true;
        self.finish(result, started)
    }

    /// Plan a migration and check the first step's preconditions without
    /// writing anything. Later preconditions are evaluated against the
    /// unmigrated tree and only reported as warnings.
    pub fn dry_run_migration(&self, target: &str) -> MigrationResult {
        let started = Instant::now();
        let mut result = MigrationResult::new(true);

        let Some((from, _, path)) = self.plan(target, &mut result) else {
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        };

        let step_ctx = StepContext {
            layout: &self.ctx.layout,
            writer: &self.ctx.writer,
        };
        for (position, planned) in path.iter().enumerate() {
            let label = planned.label();
            if planned.step.requires_confirmation {
                result
                    .diagnostics
                    .warn(&label, "step requires operator confirmation");
            }
            for condition in &planned.step.preconditions {
                let message = match condition.evaluate(&step_ctx) {
                    Ok(true) => continue,
                    Ok(false) => format!("precondition '{}' does not hold", condition.name),
                    Err(e) => format!("precondition '{}' could not be checked: {e:#}", condition.name),
                };
                if position == 0 {
                    result.diagnostics.error(&label, message);
                } else {
                    result
                        .diagnostics
                        .warn(&label, format!("{message} (before earlier steps are applied)"));
                }
            }
        }

        result.success = !result.diagnostics.has_errors();
        result.reached_version = Some(from);
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "[MIGRATION] Dry run: {} step(s) planned, {} error(s)",
            result.steps_planned.len(),
            result.diagnostics.errors.len()
        );
        result
    }

    /// Resolve current version, target and path; records failures.
    fn plan(
        &self,
        target: &str,
        result: &mut MigrationResult,
    ) -> Option<(SchemaVersion, SchemaVersion, Vec<&RegisteredStep>)> {
        let to: SchemaVersion = match target.parse() {
            Ok(to) => to,
            Err(e) => {
                result.diagnostics.error("plan", e.to_string());
                return None;
            }
        };
        result.target_version = Some(to);

        let from = match detect_version(&self.ctx.layout) {
            Ok(Some(from)) => from,
            Ok(None) => {
                result
                    .diagnostics
                    .error("detect", "workspace schema version could not be detected");
                return None;
            }
            Err(e) => {
                result.diagnostics.error("detect", e.to_string());
                return None;
            }
        };
        result.from_version = Some(from);
        result.reached_version = Some(from);

        match self.registry.get_migration_path(&from, &to) {
            Ok(path) => {
                result.steps_planned = path.iter().map(|p| p.label()).collect();
                Some((from, to, path))
            }
            Err(e) => {
                result.diagnostics.error("plan", e.to_string());
                None
            }
        }
    }

    fn apply_step(&self, planned: &RegisteredStep, step_ctx: &StepContext<'_>, result: &mut MigrationResult) -> StepResult {
        let label = planned.label();
        let step = &planned.step;

        if step.idempotent && !step.postconditions.is_empty() && holds_all(&step.postconditions, step_ctx) {
            info!("[MIGRATION] {} already applied, skipping", label);
            return StepResult::Skipped;
        }

        for condition in &step.preconditions {
            match condition.evaluate(step_ctx) {
                Ok(true) => {}
                Ok(false) => {
                    result
                        .diagnostics
                        .error(&label, format!("precondition '{}' does not hold", condition.name));
                    return StepResult::Failed;
                }
                Err(e) => {
                    result.diagnostics.error(
                        &label,
                        format!("precondition '{}' could not be checked: {e:#}", condition.name),
                    );
                    return StepResult::Failed;
                }
            }
        }

        info!("[MIGRATION] Applying {}: {}", label, step.description);
        if let Err(e) = step.run(step_ctx) {
            result.diagnostics.error(&label, format!("migration action failed: {e:#}"));
            return StepResult::Failed;
        }

        for condition in &step.postconditions {
            match condition.evaluate(step_ctx) {
                Ok(true) => {}
                Ok(false) => {
                    result
                        .diagnostics
                        .error(&label, format!("postcondition '{}' does not hold", condition.name));
                    return StepResult::Failed;
                }
                Err(e) => {
                    result.diagnostics.error(
                        &label,
                        format!("postcondition '{}' could not be checked: {e:#}", condition.name),
                    );
                    return StepResult::Failed;
                }
            }
        }
        StepResult::Applied
    }

    fn finish(&self, mut result: MigrationResult, started: Instant) -> MigrationResult {
        result.duration_ms = started.elapsed().as_millis() as u64;
        let action = if result.success {
            "migration_completed"
        } else {
            "migration_failed"
        };
        if !result.success {
            let errors: Vec<String> = result.diagnostics.errors.iter().map(|d| d.to_string()).collect();
            warn!("[MIGRATION] Migration failed: {}", errors.join("; "));
            self.ctx
                .errors
                .log_error(&format!("migration failed: {}", errors.join("; ")), Severity::Error);
        }
        self.ctx.record(
            action,
            MIGRATION_AUDIT_COMPONENT,
            json!({
                "from_version": result.from_version,
                "target_version": result.target_version,
                "reached_version": result.reached_version,
                "steps_completed": result.steps_completed,
                "steps_skipped": result.steps_skipped,
                "backup_path": result.backup_path.as_deref().map(|p| self.ctx.layout.relative(p)),
                "duration_ms": result.duration_ms,
            }),
        );
        result
    }
}

enum StepResult {
    Applied,
    Skipped,
    Failed,
}

fn holds_all(conditions: &[Condition], ctx: &StepContext<'_>) -> bool {
    conditions.iter().all(|c| matches!(c.evaluate(ctx), Ok(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::config::VaultConfig;
    use crate::stores::{ComponentMap, MemoryComponent, MemoryErrorSink};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> Arc<VaultContext> {
        let config = VaultConfig::for_root(dir.path());
        Arc::new(VaultContext::new(
            config.clone(),
            Arc::new(MemoryComponent::new(ComponentMap::new())),
            Arc::new(MemoryComponent::new(ComponentMap::new())),
            Arc::new(config),
            Arc::new(MemoryErrorSink::default()),
        ))
    }

    fn marker_step(from: &str, to: &str, file: &'static str) -> MigrationStep {
        MigrationStep::new(from, to, "touch marker", move |ctx| {
            std::fs::write(ctx.layout.root().join(file), "done")?;
            Ok(())
        })
        .postcondition(Condition::new("marker written", move |ctx| {
            Ok(ctx.layout.root().join(file).exists())
        }))
    }

    fn registry() -> MigrationRegistry {
        let mut registry = MigrationRegistry::new();
        registry.register(marker_step("1.0.0", "2.0.0", "two")).unwrap();
        registry.register(marker_step("2.0.0", "3.0.0", "three")).unwrap();
        registry
    }

    fn start_at(dir: &TempDir, version: &str) {
        std::fs::write(dir.path().join("version.txt"), version).unwrap();
    }

    #[test]
    fn test_migrate_runs_steps_and_writes_marker() {
        let dir = TempDir::new().unwrap();
        start_at(&dir, "1.0.0");
        let ctx = context(&dir);
        let executor = MigrationExecutor::new(ctx.clone(), registry());

        let result = executor.migrate("3.0.0", true, None);
        assert!(result.success, "{:?}", result.diagnostics);
        assert_eq!(result.steps_completed, vec!["1.0.0 -> 2.0.0", "2.0.0 -> 3.0.0"]);
        assert!(result.backup_path.as_ref().is_some_and(|p| p.exists()));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("version.txt")).unwrap().trim(),
            "3.0.0"
        );

        let applied = ctx
            .audit
            .query_audit_events(
                &AuditQuery::component(MIGRATION_AUDIT_COMPONENT).with_action("migration_step_applied"),
            )
            .unwrap();
        assert_eq!(applied.len(), 2);
    }

    #[test]
    fn test_failed_safety_backup_aborts_with_its_diagnostics() {
        let dir = TempDir::new().unwrap();
        start_at(&dir, "1.0.0");
        let config = VaultConfig::for_root(dir.path());
        let snapshot = Arc::new(MemoryComponent::new(ComponentMap::new()));
        snapshot.set_fail_reads(true);
        let ctx = Arc::new(VaultContext::new(
            config.clone(),
            snapshot,
            Arc::new(MemoryComponent::new(ComponentMap::new())),
            Arc::new(config),
            Arc::new(MemoryErrorSink::default()),
        ));
        let executor = MigrationExecutor::new(ctx, registry());

        let result = executor.migrate("3.0.0", true, None);
        assert!(!result.success);
        assert!(result.steps_completed.is_empty());
        assert!(result.diagnostics.errors.len() >= 2);
        assert!(result.diagnostics.errors.iter().any(|d| d.step == "backup"));
        assert!(!dir.path().join("two").exists());
    }

    #[test]
    fn test_already_at_target_is_trivial() {
        let dir = TempDir::new().unwrap();
        start_at(&dir, "3.0");
        let executor = MigrationExecutor::new(context(&dir), registry());

        let result = executor.migrate("3.0.0", true, None);
        assert!(result.success);
        assert!(result.steps_planned.is_empty());
        assert!(result.backup_path.is_none());
    }

    #[test]
    fn test_failed_postcondition_stops_run() {
        let dir = TempDir::new().unwrap();
        start_at(&dir, "1.0.0");
        let mut registry = MigrationRegistry::new();
        registry
            .register(
                MigrationStep::new("1.0.0", "2.0.0", "claims success", |_| Ok(()))
                    .postcondition(Condition::new("never", |_| Ok(false))),
            )
            .unwrap();
        registry.register(marker_step("2.0.0", "3.0.0", "three")).unwrap();
        let executor = MigrationExecutor::new(context(&dir), registry);

        let result = executor.migrate("3.0.0", false, None);
        assert!(!result.success);
        assert!(result.steps_completed.is_empty());
        assert!(!dir.path().join("three").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("version.txt")).unwrap(),
            "1.0.0"
        );
    }

    #[test]
    fn test_failed_precondition_skips_action() {
        let dir = TempDir::new().unwrap();
        start_at(&dir, "1.0.0");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut registry = MigrationRegistry::new();
        registry
            .register(
                MigrationStep::new("1.0.0", "2.0.0", "guarded", move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .precondition(Condition::new("blocked", |_| Ok(false))),
            )
            .unwrap();
        let executor = MigrationExecutor::new(context(&dir), registry);

        let result = executor.migrate("2.0.0", false, None);
        assert!(!result.success);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_declined_confirmation_aborts_before_backup() {
        let dir = TempDir::new().unwrap();
        start_at(&dir, "1.0.0");
        let mut registry = MigrationRegistry::new();
        registry
            .register(marker_step("1.0.0", "2.0.0", "two").requires_confirmation())
            .unwrap();
        let executor = MigrationExecutor::new(context(&dir), registry);

        let declined = executor.migrate("2.0.0", true, Some(&|_: &MigrationStep| false));
        assert!(!declined.success);
        assert!(declined.backup_path.is_none());
        assert!(!dir.path().join("two").exists());
        assert!(!dir.path().join("backups").exists());

        let no_callback = executor.migrate("2.0.0", false, None);
        assert!(!no_callback.success);

        let accepted = executor.migrate("2.0.0", false, Some(&|_: &MigrationStep| true));
        assert!(accepted.success);
    }

    #[test]
    fn test_idempotent_step_already_applied_is_skipped() {
        let dir = TempDir::new().unwrap();
        start_at(&dir, "1.0.0");
        std::fs::write(dir.path().join("two"), "pre-existing").unwrap();
        let mut registry = MigrationRegistry::new();
        registry
            .register(marker_step("1.0.0", "2.0.0", "two").idempotent())
            .unwrap();
        let executor = MigrationExecutor::new(context(&dir), registry);

        let result = executor.migrate("2.0.0", false, None);
        assert!(result.success);
        assert_eq!(result.steps_skipped, vec!["1.0.0 -> 2.0.0"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("two")).unwrap(),
            "pre-existing"
        );
    }

    #[test]
    fn test_dry_run_reports_without_writing() {
        let dir = TempDir::new().unwrap();
        start_at(&dir, "1.0.0");
        let executor = MigrationExecutor::new(context(&dir), registry());

        let result = executor.dry_run_migration("3.0.0");
        assert!(result.success);
        assert!(result.dry_run);
        assert_eq!(result.steps_planned.len(), 2);
        assert!(result.steps_completed.is_empty());
        assert!(result.backup_path.is_none());
        assert!(!dir.path().join("two").exists());
        assert!(!dir.path().join("audit_logs").exists());
    }

    #[test]
    fn test_unknown_version_and_missing_path() {
        let dir = TempDir::new().unwrap();
        let executor = MigrationExecutor::new(context(&dir), registry());
        let unknown = executor.migrate("3.0.0", false, None);
        assert!(!unknown.success);
        assert_eq!(unknown.diagnostics.errors[0].step, "detect");

        start_at(&dir, "3.0.0");
        let backward = executor.migrate("1.0.0", false, None);
        assert!(!backward.success);
        assert_eq!(backward.diagnostics.errors[0].step, "plan");
    }
}
