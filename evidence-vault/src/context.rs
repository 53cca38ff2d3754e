//! Per-session context shared by every component.
//!
//! One `VaultContext` lives for one investigation session. It owns the
//! configuration, the storage layout, the audit log and handles to the
//! external stores and the error sink; components receive it as an
//! `Arc<VaultContext>` instead of reaching for process-wide state.

use crate::audit::{AuditEvent, AuditLog};
use crate::config::VaultConfig;
use crate::fs::{AtomicWriter, StorageLayout};
use crate::stores::{
    ConfigSource, ErrorSink, FileSnapshotStore, FileStateStore, Severity, SnapshotStore,
    StateStore, TracingErrorSink,
};
use serde_json::Value;
use std::sync::Arc;

pub struct VaultContext {
    pub config: VaultConfig,
    pub layout: StorageLayout,
    pub writer: AtomicWriter,
    pub audit: AuditLog,
    pub session_id: String,
    pub errors: Arc<dyn ErrorSink>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub state: Arc<dyn StateStore>,
    pub config_source: Arc<dyn ConfigSource>,
}

impl VaultContext {
    pub fn new(
        config: VaultConfig,
        snapshots: Arc<dyn SnapshotStore>,
        state: Arc<dyn StateStore>,
        config_source: Arc<dyn ConfigSource>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        let layout = StorageLayout::new(config.storage.root.clone());
        let writer = AtomicWriter::from_config(&config.write);
        let audit = AuditLog::new(layout.clone(), writer.clone(), config.audit.max_file_bytes);

        Self {
            config,
            layout,
            writer,
            audit,
            session_id: uuid::Uuid::new_v4().to_string(),
            errors,
            snapshots,
            state,
            config_source,
        }
    }

    /// Context backed by the workspace's own snapshot and state files, with
    /// the vault configuration itself as the active configuration.
    pub fn with_file_stores(config: VaultConfig) -> Self {
        let layout = StorageLayout::new(config.storage.root.clone());
        let writer = AtomicWriter::from_config(&config.write);
        let snapshots = Arc::new(FileSnapshotStore::new(layout.clone(), writer.clone()));
        let state = Arc::new(FileStateStore::new(layout, writer));
        let config_source = Arc::new(config.clone());

        Self::new(config, snapshots, state, config_source, Arc::new(TracingErrorSink))
    }

    /// Record an audit event tagged with the session id, without letting an
    /// audit failure mask the caller's result; failures go to the error sink.
    pub fn record(&self, action: &str, component: &str, metadata: Value) -> Option<AuditEvent> {
        let mut metadata = crate::audit::to_map(metadata);
        metadata
            .entry("session_id")
            .or_insert_with(|| Value::String(self.session_id.clone()));

        match self.audit.log_audit_event(action, component, metadata) {
            Ok(event) => Some(event),
            Err(e) => {
                self.errors.log_error(
                    &format!("audit event '{action}' for '{component}' not recorded: {e}"),
                    Severity::Error,
                );
                None
            }
        }
    }
}
