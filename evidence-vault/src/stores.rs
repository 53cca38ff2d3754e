//! Contracts of the collaborators the vault reads from and writes to.
//!
//! The observation snapshot store, the investigation state store and the
//! configuration loader all exchange a canonical key-value map. The error
//! sink is fire-and-forget: its signature cannot fail.

use crate::config::VaultConfig;
use crate::fs::{AtomicWriter, StorageLayout};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Canonical key-value form of a snapshot, a state or a configuration.
pub type ComponentMap = Map<String, Value>;

pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> anyhow::Result<ComponentMap>;
    fn save(&self, snapshot: &ComponentMap) -> anyhow::Result<()>;

    /// Files backing the store, recorded in backup manifests.
    fn source_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

pub trait StateStore: Send + Sync {
    fn get_current(&self) -> anyhow::Result<ComponentMap>;
    fn set_current(&self, state: &ComponentMap) -> anyhow::Result<()>;

    fn source_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

pub trait ConfigSource: Send + Sync {
    fn get_active_config(&self) -> anyhow::Result<ComponentMap>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Diagnostic channel for operators.
pub trait ErrorSink: Send + Sync {
    fn log_error(&self, message: &str, severity: Severity);
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn log_error(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => info!(target: "evidence_vault::errors", "{}", message),
            Severity::Warning => warn!(target: "evidence_vault::errors", "{}", message),
            Severity::Error | Severity::Critical => {
                error!(target: "evidence_vault::errors", severity = ?severity, "{}", message)
            }
        }
    }
}

/// Keeps diagnostics in memory; handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryErrorSink {
    entries: Mutex<Vec<(String, Severity)>>,
}

impl MemoryErrorSink {
    pub fn entries(&self) -> Vec<(String, Severity)> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ErrorSink for MemoryErrorSink {
    fn log_error(&self, message: &str, severity: Severity) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((message.to_string(), severity));
    }
}

/// In-memory component holder with switchable failures.
#[derive(Debug, Default)]
pub struct MemoryComponent {
    data: Mutex<ComponentMap>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryComponent {
    pub fn new(data: ComponentMap) -> Self {
        Self {
            data: Mutex::new(data),
            ..Self::default()
        }
    }

    pub fn get(&self) -> ComponentMap {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, data: ComponentMap) {
        *self.data.lock().unwrap_or_else(|e| e.into_inner()) = data;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read(&self, what: &str) -> anyhow::Result<ComponentMap> {
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("{what} store unavailable");
        }
        Ok(self.get())
    }

    fn write(&self, what: &str, data: &ComponentMap) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("{what} store rejected write");
        }
        self.replace(data.clone());
        Ok(())
    }
}

pub type MemorySnapshotStore = MemoryComponent;
pub type MemoryStateStore = MemoryComponent;

impl SnapshotStore for MemoryComponent {
    fn load(&self) -> anyhow::Result<ComponentMap> {
        self.read("snapshot")
    }

    fn save(&self, snapshot: &ComponentMap) -> anyhow::Result<()> {
        self.write("snapshot", snapshot)
    }
}

impl StateStore for MemoryComponent {
    fn get_current(&self) -> anyhow::Result<ComponentMap> {
        self.read("state")
    }

    fn set_current(&self, state: &ComponentMap) -> anyhow::Result<()> {
        self.write("state", state)
    }
}

/// Observation snapshot persisted in the workspace.
///
/// Reads fall back to the legacy flat `observations.json` so a workspace can
/// be backed up before it is migrated. Writes go to the file that was read,
/// so an unmigrated workspace stays in one layout.
pub struct FileSnapshotStore {
    layout: StorageLayout,
    writer: AtomicWriter,
}

impl FileSnapshotStore {
    pub fn new(layout: StorageLayout, writer: AtomicWriter) -> Self {
        Self { layout, writer }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> anyhow::Result<ComponentMap> {
        read_component(&[self.layout.snapshot_file(), self.layout.legacy_snapshot_file()])
    }

    fn save(&self, snapshot: &ComponentMap) -> anyhow::Result<()> {
        let target = write_target(self.layout.snapshot_file(), self.layout.legacy_snapshot_file());
        self.writer.write_json(&target, snapshot)?;
        Ok(())
    }

    fn source_paths(&self) -> Vec<PathBuf> {
        existing(&[self.layout.snapshot_file(), self.layout.legacy_snapshot_file()])
    }
}

/// Investigation state persisted in the workspace, same fallback rules as
/// [`FileSnapshotStore`].
pub struct FileStateStore {
    layout: StorageLayout,
    writer: AtomicWriter,
}

impl FileStateStore {
    pub fn new(layout: StorageLayout, writer: AtomicWriter) -> Self {
        Self { layout, writer }
    }
}

impl StateStore for FileStateStore {
    fn get_current(&self) -> anyhow::Result<ComponentMap> {
        read_component(&[self.layout.state_file(), self.layout.legacy_state_file()])
    }

    fn set_current(&self, state: &ComponentMap) -> anyhow::Result<()> {
        let target = write_target(self.layout.state_file(), self.layout.legacy_state_file());
        self.writer.write_json(&target, state)?;
        Ok(())
    }

    fn source_paths(&self) -> Vec<PathBuf> {
        existing(&[self.layout.state_file(), self.layout.legacy_state_file()])
    }
}

impl ConfigSource for VaultConfig {
    fn get_active_config(&self) -> anyhow::Result<ComponentMap> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!("configuration serialized to {other} instead of an object"),
        }
    }
}

/// First existing candidate, parsed as a JSON object; empty when none exists.
fn read_component(candidates: &[PathBuf]) -> anyhow::Result<ComponentMap> {
    let Some(path) = candidates.iter().find(|p| p.exists()) else {
        return Ok(ComponentMap::new());
    };
    parse_component_file(path)
}

pub(crate) fn parse_component_file(path: &Path) -> anyhow::Result<ComponentMap> {
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content)? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{} does not contain a JSON object", path.display()),
    }
}

/// The legacy file while it is the only one present, otherwise the current one.
fn write_target(current: PathBuf, legacy: PathBuf) -> PathBuf {
    if !current.exists() && legacy.exists() {
        legacy
    } else {
        current
    }
}

fn existing(candidates: &[PathBuf]) -> Vec<PathBuf> {
    candidates.iter().filter(|p| p.exists()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn map(value: Value) -> ComponentMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_file_snapshot_store_roundtrip() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let layout = StorageLayout::new(dir.path());
        let store = FileSnapshotStore::new(layout.clone(), AtomicWriter::default());

        assert!(store.load()?.is_empty());
        store.save(&map(json!({"file:a.rs": {"lines": 10}})))?;

        assert_eq!(store.load()?, map(json!({"file:a.rs": {"lines": 10}})));
        assert_eq!(store.source_paths(), vec![layout.snapshot_file()]);
        Ok(())
    }

    #[test]
    fn test_file_state_store_reads_legacy_layout() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let layout = StorageLayout::new(dir.path());
        std::fs::write(layout.legacy_state_file(), r#"{"phase":"triage"}"#)?;
        let store = FileStateStore::new(layout.clone(), AtomicWriter::default());

        assert_eq!(store.get_current()?, map(json!({"phase": "triage"})));

        store.set_current(&map(json!({"phase": "report"})))?;
        assert_eq!(store.get_current()?, map(json!({"phase": "report"})));
        assert!(!layout.state_file().exists());
        assert_eq!(
            parse_component_file(&layout.legacy_state_file())?,
            map(json!({"phase": "report"}))
        );
        Ok(())
    }

    #[test]
    fn test_file_stores_prefer_current_layout_when_both_exist() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let layout = StorageLayout::new(dir.path());
        std::fs::write(layout.legacy_snapshot_file(), r#"{"old":true}"#)?;
        std::fs::create_dir_all(layout.snapshot_file().parent().unwrap())?;
        std::fs::write(layout.snapshot_file(), r#"{"new":true}"#)?;
        let store = FileSnapshotStore::new(layout.clone(), AtomicWriter::default());

        store.save(&map(json!({"saved": 1})))?;
        assert_eq!(parse_component_file(&layout.snapshot_file())?, map(json!({"saved": 1})));
        assert_eq!(parse_component_file(&layout.legacy_snapshot_file())?, map(json!({"old": true})));
        Ok(())
    }

    #[test]
    fn test_non_object_component_rejected() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let layout = StorageLayout::new(dir.path());
        std::fs::create_dir_all(layout.snapshot_file().parent().unwrap())?;
        std::fs::write(layout.snapshot_file(), "[1,2,3]")?;

        let store = FileSnapshotStore::new(layout, AtomicWriter::default());
        assert!(store.load().is_err());
        Ok(())
    }

    #[test]
    fn test_memory_component_failures() {
        let store = MemoryComponent::new(map(json!({"a": 1})));
        assert!(SnapshotStore::load(&store).is_ok());

        store.set_fail_reads(true);
        assert!(SnapshotStore::load(&store).is_err());

        store.set_fail_writes(true);
        assert!(StateStore::set_current(&store, &ComponentMap::new()).is_err());
        assert_eq!(store.get(), map(json!({"a": 1})));
    }

    #[test]
    fn test_config_source_is_object() -> anyhow::Result<()> {
        let config = VaultConfig::default().get_active_config()?;
        assert!(config.contains_key("backup"));
        assert!(config.contains_key("audit"));
        Ok(())
    }

    #[test]
    fn test_memory_error_sink_records() {
        let sink = MemoryErrorSink::default();
        sink.log_error("checkpoint missing", Severity::Critical);
        assert_eq!(
            sink.entries(),
            vec![("checkpoint missing".to_string(), Severity::Critical)]
        );
    }
}
