#![allow(dead_code)]

use evidence_vault::stores::{ComponentMap, MemoryComponent, MemoryErrorSink};
use evidence_vault::{VaultConfig, VaultContext};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

pub fn map(value: Value) -> ComponentMap {
    value.as_object().cloned().unwrap_or_default()
}

/// A workspace in a temp dir with in-memory snapshot and state stores.
pub struct Workspace {
    pub dir: TempDir,
    pub ctx: Arc<VaultContext>,
    pub snapshot: Arc<MemoryComponent>,
    pub state: Arc<MemoryComponent>,
    pub errors: Arc<MemoryErrorSink>,
}

impl Workspace {
    pub fn new(snapshot: Value, state: Value) -> Self {
        let dir = TempDir::new().unwrap();
        Self::at(dir, snapshot, state)
    }

    pub fn at(dir: TempDir, snapshot: Value, state: Value) -> Self {
        let config = VaultConfig::for_root(dir.path());
        let snapshot = Arc::new(MemoryComponent::new(map(snapshot)));
        let state = Arc::new(MemoryComponent::new(map(state)));
        let errors = Arc::new(MemoryErrorSink::default());
        let config_source = Arc::new(config.clone());
        let ctx = Arc::new(VaultContext::new(
            config,
            snapshot.clone(),
            state.clone(),
            config_source,
            errors.clone(),
        ));
        Self {
            dir,
            ctx,
            snapshot,
            state,
            errors,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Push a file's modification time `days` into the past.
pub fn age(path: &Path, days: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(days * 86_400))
        .unwrap();
}
