//! Evidence Vault - operator entry point
//!
//! Every command prints its outcome record as JSON on stdout; logs go to
//! stderr. Commands that write to the workspace hold the workspace lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use evidence_vault::audit::{AuditQuery, ExportFormat};
use evidence_vault::backup::{BackupCreator, BackupType};
use evidence_vault::daemon::shutdown::ShutdownCoordinator;
use evidence_vault::fs::WorkspaceLock;
use evidence_vault::migration::{
    default_registry, detect_version, stamp_current_version, MigrationExecutor, MigrationStep,
    CURRENT_SCHEMA_VERSION, MIGRATION_AUDIT_COMPONENT,
};
use evidence_vault::restore::RestoreEngine;
use evidence_vault::{utils, VaultConfig, VaultContext};
use serde::Serialize;
use serde_json::json;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Workspace root (overrides config and EVIDENCE_VAULT_ROOT)
    #[arg(short, long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stamp a new workspace with the current schema version
    Init,

    /// Create a full or emergency backup
    Backup {
        #[arg(long = "type", default_value = "full")]
        backup_type: BackupType,
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Create an incremental backup against the newest backup at or before --since
    BackupIncremental {
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },

    /// List backups, newest first
    List {
        #[arg(long = "type")]
        backup_type: Option<BackupType>,
    },

    /// Validate a backup and its parent chain
    Verify { path: PathBuf },

    /// Restore live snapshot and state from a backup
    Restore { path: PathBuf },

    /// Show what a backup declares about itself
    Info { path: PathBuf },

    /// Delete backups older than the retention window
    Cleanup {
        #[arg(long = "type")]
        backup_type: Option<BackupType>,
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Verify audit hash chains (one file, or every file)
    AuditVerify { file: Option<PathBuf> },

    /// Query audit events
    AuditQuery {
        #[command(flatten)]
        filter: AuditFilter,
    },

    /// Summarize the audit log
    AuditSummary,

    /// Export audit events as JSON or CSV
    AuditExport {
        #[arg(long, default_value = "json")]
        format: ExportFormat,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        #[command(flatten)]
        filter: AuditFilter,
    },

    /// Delete audit files older than the retention window
    AuditCleanup {
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Migrate the workspace schema
    Migrate {
        /// Target version (defaults to the current schema)
        #[arg(long)]
        target: Option<String>,
        /// Plan and check preconditions only
        #[arg(long)]
        dry_run: bool,
        /// Confirm every step that asks for confirmation
        #[arg(short, long)]
        yes: bool,
        /// Skip the safety backup
        #[arg(long)]
        no_backup: bool,
    },

    /// Print the detected workspace schema version
    DetectVersion,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct AuditFilter {
    #[arg(long)]
    component: Option<String>,
    #[arg(long)]
    action: Option<String>,
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    #[arg(long)]
    end: Option<DateTime<Utc>>,
    #[arg(long)]
    limit: Option<usize>,
}

impl From<AuditFilter> for AuditQuery {
    fn from(filter: AuditFilter) -> Self {
        AuditQuery {
            component: filter.component,
            action: filter.action,
            start: filter.start,
            end: filter.end,
            limit: filter.limit,
        }
    }
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Init => "init",
            Command::Backup { .. } => "backup",
            Command::BackupIncremental { .. } => "backup-incremental",
            Command::List { .. } => "list",
            Command::Verify { .. } => "verify",
            Command::Restore { .. } => "restore",
            Command::Info { .. } => "info",
            Command::Cleanup { .. } => "cleanup",
            Command::AuditVerify { .. } => "audit-verify",
            Command::AuditQuery { .. } => "audit-query",
            Command::AuditSummary => "audit-summary",
            Command::AuditExport { .. } => "audit-export",
            Command::AuditCleanup { .. } => "audit-cleanup",
            Command::Migrate { .. } => "migrate",
            Command::DetectVersion => "detect-version",
        }
    }

    fn is_mutating(&self) -> bool {
        match self {
            Command::Init
            | Command::Backup { .. }
            | Command::BackupIncremental { .. }
            | Command::Restore { .. }
            | Command::Cleanup { .. }
            | Command::AuditCleanup { .. } => true,
            Command::Migrate { dry_run, .. } => !dry_run,
            _ => false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => VaultConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => VaultConfig::from_env(),
    };
    if let Some(root) = &args.root {
        config.storage.root = root.clone();
    }

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    utils::logger::init(&log_level, &config.log.output)?;

    tracing::info!(
        "evidence-vault v{} (workspace: {})",
        env!("CARGO_PKG_VERSION"),
        config.storage.root.display()
    );

    let ctx = Arc::new(VaultContext::with_file_stores(config));
    let command = args.command;
    let label = command.name();

    let _lock = if command.is_mutating() {
        Some(WorkspaceLock::acquire(&ctx.layout.lock_file(), label)?)
    } else {
        None
    };

    let coordinator = ShutdownCoordinator::new();
    let success = coordinator
        .run_blocking(label, move || run(command, ctx))
        .await??;

    if coordinator.token().is_cancelled() {
        tracing::warn!("'{}' completed after a shutdown request", label);
        return Ok(ExitCode::from(130));
    }

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Execute one command; `Ok(false)` means the outcome reported failure.
fn run(command: Command, ctx: Arc<VaultContext>) -> Result<bool> {
    match command {
        Command::Init => {
            if let Some(version) = detect_version(&ctx.layout)? {
                emit(&json!({ "initialized": false, "version": version }))?;
                return Ok(version == CURRENT_SCHEMA_VERSION);
            }
            ctx.layout.ensure_backup_dirs()?;
            stamp_current_version(&ctx.layout, &ctx.writer)?;
            ctx.record(
                "workspace_initialized",
                MIGRATION_AUDIT_COMPONENT,
                json!({ "version": CURRENT_SCHEMA_VERSION }),
            );
            emit(&json!({ "initialized": true, "version": CURRENT_SCHEMA_VERSION }))?;
            Ok(true)
        }

        Command::Backup {
            backup_type,
            description,
        } => {
            let outcome = BackupCreator::new(ctx).perform_backup(backup_type, description.as_deref());
            emit(&outcome)?;
            Ok(outcome.success)
        }

        Command::BackupIncremental { since } => {
            let outcome = BackupCreator::new(ctx).perform_incremental_backup(since);
            emit(&outcome)?;
            Ok(outcome.success)
        }

        Command::List { backup_type } => {
            emit(&BackupCreator::new(ctx).list_backups(backup_type)?)?;
            Ok(true)
        }

        Command::Verify { path } => {
            let verification = BackupCreator::new(ctx).verify_backup(&path);
            emit(&verification)?;
            Ok(verification.valid)
        }

        Command::Restore { path } => {
            let outcome = RestoreEngine::new(ctx).perform_restore(&path)?;
            emit(&outcome)?;
            Ok(outcome.success)
        }

        Command::Info { path } => {
            emit(&RestoreEngine::new(ctx).get_backup_info(&path)?)?;
            Ok(true)
        }

        Command::Cleanup {
            backup_type,
            retention_days,
        } => {
            let days = retention_days.unwrap_or(ctx.config.backup.retention_days);
            let report = BackupCreator::new(ctx).cleanup_old_backups(backup_type, days)?;
            emit(&report)?;
            Ok(!report.diagnostics.has_errors())
        }

        Command::AuditVerify { file } => {
            let files = match file {
                Some(file) => vec![file],
                None => ctx.audit.audit_files(None)?,
            };
            let reports = files
                .iter()
                .map(|f| ctx.audit.verify_audit_chain(f))
                .collect::<evidence_vault::Result<Vec<_>>>()?;
            let valid = reports.iter().all(|r| r.valid);
            emit(&json!({ "valid": valid, "files": reports }))?;
            Ok(valid)
        }

        Command::AuditQuery { filter } => {
            emit(&ctx.audit.query_audit_events(&filter.into())?)?;
            Ok(true)
        }

        Command::AuditSummary => {
            let summary = ctx.audit.create_audit_summary()?;
            emit(&summary)?;
            Ok(summary.chain_valid)
        }

        Command::AuditExport {
            format,
            output,
            filter,
        } => {
            let rendered = ctx.audit.export_audit_trail(format, &filter.into())?;
            match output {
                Some(path) => {
                    ctx.writer.write(&path, rendered.as_bytes())?;
                    emit(&json!({ "written": path, "bytes": rendered.len() }))?;
                }
                None => print!("{rendered}"),
            }
            Ok(true)
        }

        Command::AuditCleanup { retention_days } => {
            let days = retention_days.unwrap_or(ctx.config.audit.retention_days);
            let report = ctx.audit.cleanup_old_audit_logs(days)?;
            emit(&report)?;
            Ok(report.errors.is_empty())
        }

        Command::Migrate {
            target,
            dry_run,
            yes,
            no_backup,
        } => {
            let target = target.unwrap_or_else(|| CURRENT_SCHEMA_VERSION.to_string());
            let executor = MigrationExecutor::new(ctx, default_registry()?);
            let result = if dry_run {
                executor.dry_run_migration(&target)
            } else if yes {
                executor.migrate(&target, !no_backup, Some(&|_: &MigrationStep| true))
            } else {
                executor.migrate(&target, !no_backup, Some(&prompt_confirmation))
            };
            emit(&result)?;
            Ok(result.success)
        }

        Command::DetectVersion => {
            let detected = detect_version(&ctx.layout)?;
            emit(&json!({
                "version": detected,
                "current": CURRENT_SCHEMA_VERSION,
                "up_to_date": detected == Some(CURRENT_SCHEMA_VERSION),
            }))?;
            Ok(detected.is_some())
        }
    }
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Ask on stderr, read the answer from stdin; anything but yes declines.
fn prompt_confirmation(step: &MigrationStep) -> bool {
    let mut stderr = std::io::stderr();
    let _ = write!(
        stderr,
        "Apply migration {} -> {} ({})? [y/N] ",
        step.from_version(),
        step.to_version(),
        step.description
    );
    let _ = stderr.flush();

    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
