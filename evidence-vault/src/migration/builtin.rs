//! Migration steps shipped with the vault.
//!
//! ```text
//! 1.0.0  observations.json, state.json and backups/backup_*.json at the root
//! 2.0.0  snapshot/snapshot.json, state/current.json, metadata.json
//! 3.0.0  backups sorted into backups/{full,incremental,emergency}/
//! ```

use super::registry::{Condition, MigrationRegistry, MigrationStep, StepContext};
use super::version::{write_version_marker, SchemaVersion, CURRENT_SCHEMA_VERSION};
use crate::fs::layout::parse_backup_file_name;
use crate::fs::walker::{walk_directory, FileInfo, WalkOptions};
use crate::fs::{AtomicWriter, StorageLayout};
use crate::utils::Result;
use anyhow::{bail, Context};
use chrono::Utc;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::info;

pub fn default_registry() -> Result<MigrationRegistry> {
    let mut registry = MigrationRegistry::new();
    registry.register(component_directories_step())?;
    registry.register(typed_backup_directories_step())?;
    Ok(registry)
}

/// Mark a fresh workspace as being at the current schema.
pub fn stamp_current_version(layout: &StorageLayout, writer: &AtomicWriter) -> Result<()> {
    write_schema_metadata(layout, writer, CURRENT_SCHEMA_VERSION)?;
    write_version_marker(layout, writer, CURRENT_SCHEMA_VERSION)
}

fn component_directories_step() -> MigrationStep {
    MigrationStep::new(
        "1.0.0",
        "2.0.0",
        "Move flat snapshot and state files into component directories",
        |ctx| {
            let layout = ctx.layout;
            move_into_place(&layout.legacy_snapshot_file(), &layout.snapshot_file())?;
            move_into_place(&layout.legacy_state_file(), &layout.state_file())?;
            write_schema_metadata(layout, ctx.writer, SchemaVersion::new(2, 0, 0))?;
            Ok(())
        },
    )
    .precondition(Condition::new("workspace root exists", |ctx| {
        Ok(ctx.layout.root().is_dir())
    }))
    .precondition(Condition::new("no conflicting component files", |ctx| {
        let l = ctx.layout;
        let snapshot_clash = l.legacy_snapshot_file().exists() && l.snapshot_file().exists();
        let state_clash = l.legacy_state_file().exists() && l.state_file().exists();
        Ok(!snapshot_clash && !state_clash)
    }))
    .postcondition(Condition::new("legacy files moved", |ctx| {
        Ok(legacy_files_gone(ctx))
    }))
    .postcondition(Condition::new("metadata declares 2.0.0", |ctx| {
        metadata_at_least(ctx, SchemaVersion::new(2, 0, 0))
    }))
    .idempotent()
}

fn typed_backup_directories_step() -> MigrationStep {
    MigrationStep::new(
        "2.0.0",
        "3.0.0",
        "Sort flat backups into per-type backup directories",
        |ctx| {
            let layout = ctx.layout;
            for file in flat_backups(layout)? {
                let name = file.file_name();
                let Some((_, backup_type)) = parse_backup_file_name(&name) else {
                    continue;
                };
                let target = layout.backup_dir(backup_type).join(&name);
                if target.exists() {
                    if std::fs::read(&target)? != std::fs::read(&file.path)? {
                        bail!("{} already exists with different content", target.display());
                    }
                    std::fs::remove_file(&file.path)?;
                } else {
                    move_into_place(&file.path, &target)?;
                }
            }
            write_schema_metadata(layout, ctx.writer, SchemaVersion::new(3, 0, 0))?;
            Ok(())
        },
    )
    .precondition(Condition::new("component directories in place", |ctx| {
        Ok(legacy_files_gone(ctx))
    }))
    .postcondition(Condition::new("no flat backups remain", |ctx| {
        Ok(flat_backups(ctx.layout)?.is_empty())
    }))
    .postcondition(Condition::new("metadata declares 3.0.0", |ctx| {
        metadata_at_least(ctx, SchemaVersion::new(3, 0, 0))
    }))
    .requires_confirmation()
    .idempotent()
}

fn move_into_place(from: &Path, to: &Path) -> anyhow::Result<()> {
    if !from.exists() {
        return Ok(());
    }
    if to.exists() {
        bail!("cannot move {}: {} already exists", from.display(), to.display());
    }
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(from, to)
        .with_context(|| format!("moving {} to {}", from.display(), to.display()))?;
    info!("[MIGRATION] Moved {} -> {}", from.display(), to.display());
    Ok(())
}

fn legacy_files_gone(ctx: &StepContext<'_>) -> bool {
    !ctx.layout.legacy_snapshot_file().exists() && !ctx.layout.legacy_state_file().exists()
}

/// `backup_*.json` files directly under `backups/`.
fn flat_backups(layout: &StorageLayout) -> std::io::Result<Vec<FileInfo>> {
    let files = walk_directory(&layout.backups_root(), &WalkOptions::with_extension("json").max_depth(1))?;
    Ok(files
        .into_iter()
        .filter(|f| parse_backup_file_name(&f.file_name()).is_some())
        .collect())
}

fn metadata_at_least(ctx: &StepContext<'_>, version: SchemaVersion) -> anyhow::Result<bool> {
    let path = ctx.layout.metadata_file();
    if !path.exists() {
        return Ok(false);
    }
    let value: Value = serde_json::from_slice(&std::fs::read(&path)?)?;
    let Some(raw) = value.get("schema_version").and_then(Value::as_str) else {
        return Ok(false);
    };
    Ok(raw.parse::<SchemaVersion>()? >= version)
}

/// Update `metadata.json`, keeping any fields already there.
fn write_schema_metadata(layout: &StorageLayout, writer: &AtomicWriter, version: SchemaVersion) -> Result<()> {
    let path = layout.metadata_file();
    let mut metadata = match std::fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        Err(_) => Map::new(),
    };
    metadata.insert("schema_version".into(), Value::String(version.to_string()));
    metadata.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
    writer.write_json(&path, &Value::Object(metadata))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupType;
    use crate::migration::version::detect_version;
    use tempfile::TempDir;

    fn legacy_workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("observations.json"), r#"{"a": 1}"#).unwrap();
        std::fs::write(dir.path().join("state.json"), r#"{"counter": 1}"#).unwrap();
        std::fs::create_dir_all(dir.path().join("backups")).unwrap();
        std::fs::write(
            dir.path().join("backups/backup_20230101_120000_full.json"),
            "{}",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_default_registry_reaches_current() -> Result<()> {
        let registry = default_registry()?;
        let path = registry.get_migration_path(&SchemaVersion::new(1, 0, 0), &CURRENT_SCHEMA_VERSION)?;
        assert_eq!(path.len(), 2);
        assert!(path[1].step.requires_confirmation);
        Ok(())
    }

    #[test]
    fn test_builtin_steps_transform_legacy_layout() -> anyhow::Result<()> {
        let dir = legacy_workspace();
        let layout = StorageLayout::new(dir.path());
        let writer = AtomicWriter::default();
        let ctx = StepContext {
            layout: &layout,
            writer: &writer,
        };
        assert_eq!(detect_version(&layout)?, Some(SchemaVersion::new(1, 0, 0)));

        let registry = default_registry()?;
        for planned in registry.steps() {
            for condition in &planned.step.preconditions {
                assert!(condition.evaluate(&ctx)?, "{}", condition.name);
            }
            planned.step.run(&ctx)?;
            for condition in &planned.step.postconditions {
                assert!(condition.evaluate(&ctx)?, "{}", condition.name);
            }
        }

        assert_eq!(std::fs::read_to_string(layout.snapshot_file())?, r#"{"a": 1}"#);
        assert!(layout.state_file().exists());
        assert!(layout
            .backup_dir(BackupType::Full)
            .join("backup_20230101_120000_full.json")
            .exists());
        assert_eq!(detect_version(&layout)?, Some(CURRENT_SCHEMA_VERSION));
        Ok(())
    }

    #[test]
    fn test_conflicting_files_block_first_step() -> anyhow::Result<()> {
        let dir = legacy_workspace();
        let layout = StorageLayout::new(dir.path());
        std::fs::create_dir_all(layout.snapshot_file().parent().unwrap())?;
        std::fs::write(layout.snapshot_file(), "{}")?;
        let writer = AtomicWriter::default();
        let ctx = StepContext {
            layout: &layout,
            writer: &writer,
        };

        let step = component_directories_step();
        let clash = &step.preconditions[1];
        assert!(!clash.evaluate(&ctx)?);
        Ok(())
    }

    #[test]
    fn test_stamp_current_version() -> Result<()> {
        let dir = TempDir::new()?;
        let layout = StorageLayout::new(dir.path());
        stamp_current_version(&layout, &AtomicWriter::default())?;
        assert_eq!(detect_version(&layout)?, Some(CURRENT_SCHEMA_VERSION));
        Ok(())
    }
}
