//! Append-only, hash-chained audit log.
//!
//! Events are grouped per component and partitioned by month:
//! `audit_logs/<component>/<YYYY>/<MM>/audit_<YYYYMMDD>_<NNN>.jsonl`. Each
//! file is one hash chain; a new numbered file starts once the active one
//! reaches the size ceiling. Appends rewrite the whole file through the
//! atomic writer so a crash never leaves a half-written line.

pub mod chain;
pub mod event;
pub mod export;
pub mod query;

pub use chain::{verify_audit_chain, ChainIssue, ChainIssueKind, ChainVerification};
pub use event::AuditEvent;
pub use export::ExportFormat;
pub use query::{AuditQuery, AuditSummary, FileChainStatus};

use crate::fs::layout::{audit_file_name, parse_audit_sequence};
use crate::fs::walker::{prune_empty_dirs, walk_directory, WalkOptions};
use crate::fs::{AtomicWriter, StorageLayout};
use crate::utils::Result;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Component under which the audit log records its own housekeeping.
pub const AUDIT_COMPONENT: &str = "audit";

#[derive(Clone)]
pub struct AuditLog {
    layout: StorageLayout,
    writer: AtomicWriter,
    max_file_bytes: u64,
    // serializes read-modify-append within this process
    append_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditCleanupReport {
    pub deleted: Vec<PathBuf>,
    pub directories_pruned: usize,
    pub errors: Vec<String>,
}

impl AuditLog {
    pub fn new(layout: StorageLayout, writer: AtomicWriter, max_file_bytes: u64) -> Self {
        Self {
            layout,
            writer,
            max_file_bytes: max_file_bytes.max(1),
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.layout.audit_root()
    }

    /// Append one signed event to the component's active file.
    pub fn log_audit_event(
        &self,
        action: &str,
        component: &str,
        metadata: Map<String, Value>,
    ) -> Result<AuditEvent> {
        let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());

        let now = Utc::now();
        let (path, previous_hash) = self.select_target(component, now.date_naive())?;
        let event = AuditEvent::new(now, action, component, metadata, previous_hash)?;

        let mut content = if path.exists() {
            std::fs::read(&path)?
        } else {
            Vec::new()
        };
        if !content.is_empty() && !content.ends_with(b"\n") {
            content.push(b'\n');
        }
        content.extend(serde_json::to_vec(&event)?);
        content.push(b'\n');

        self.writer.write(&path, &content)?;

        debug!(
            path = %path.display(),
            event_id = %event.event_id,
            "[AUDIT] Event recorded"
        );
        Ok(event)
    }

    /// Active file for `component` on `date` and the signature to chain onto.
    fn select_target(&self, component: &str, date: NaiveDate) -> Result<(PathBuf, Option<String>)> {
        let dir = self.layout.audit_month_dir(component, date);
        std::fs::create_dir_all(&dir)?;

        let latest = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| parse_audit_sequence(&e.file_name().to_string_lossy(), date))
            .max();

        let Some(sequence) = latest else {
            return Ok((dir.join(audit_file_name(date, 1)), None));
        };

        let path = dir.join(audit_file_name(date, sequence));
        let next = dir.join(audit_file_name(date, sequence + 1));

        if std::fs::metadata(&path)?.len() >= self.max_file_bytes {
            info!(path = %next.display(), "[AUDIT] Rotating audit file");
            return Ok((next, None));
        }

        match last_signature(&path)? {
            Tail::Empty => Ok((path, None)),
            Tail::Signed(signature) => Ok((path, Some(signature))),
            Tail::Unreadable => {
                warn!(
                    path = %path.display(),
                    "[AUDIT] Last line of audit file is unreadable, starting a new chain file"
                );
                Ok((next, None))
            }
        }
    }

    /// Every `.jsonl` file under the given component, or under all components.
    pub fn audit_files(&self, component: Option<&str>) -> Result<Vec<PathBuf>> {
        let dir = match component {
            Some(c) => self.layout.audit_component_dir(c),
            None => self.layout.audit_root(),
        };
        Ok(walk_directory(&dir, &WalkOptions::with_extension("jsonl"))?
            .into_iter()
            .map(|f| f.path)
            .collect())
    }

    /// Events matching `query`, oldest first.
    pub fn query_audit_events(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let mut events = Vec::new();
        for file in self.audit_files(query.component.as_deref())? {
            for event in read_events(&file)? {
                if query.matches(&event) {
                    events.push(event);
                }
            }
        }
        Ok(query.finish(events))
    }

    pub fn verify_audit_chain(&self, file: &Path) -> Result<ChainVerification> {
        verify_audit_chain(file)
    }

    /// Verify every audit file and aggregate event counts.
    pub fn create_audit_summary(&self) -> Result<AuditSummary> {
        let mut summary = AuditSummary {
            chain_valid: true,
            ..AuditSummary::default()
        };

        for file in self.audit_files(None)? {
            let report = verify_audit_chain(&file)?;
            if !report.valid {
                summary.chain_valid = false;
            }
            summary.files.push(FileChainStatus::from(&report));
            summary.files_checked += 1;

            for event in read_events(&file)? {
                summary.record_event(&event);
            }
        }

        Ok(summary)
    }

    pub fn export_audit_trail(&self, format: ExportFormat, query: &AuditQuery) -> Result<String> {
        let events = self.query_audit_events(query)?;
        export::render(&events, format)
    }

    /// Delete audit files last modified more than `retention_days` ago, audit
    /// each deletion, then prune directories left empty.
    pub fn cleanup_old_audit_logs(&self, retention_days: u32) -> Result<AuditCleanupReport> {
        let now = SystemTime::now();
        let window = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
        let mut report = AuditCleanupReport::default();

        let expired: Vec<_> = walk_directory(&self.layout.audit_root(), &WalkOptions::with_extension("jsonl"))?
            .into_iter()
            .filter(|f| f.age(now) > window)
            .collect();

        for file in expired {
            if let Err(e) = std::fs::remove_file(&file.path) {
                warn!(path = %file.path.display(), error = %e, "[AUDIT] Failed to delete expired audit file");
                report.errors.push(format!("{}: {e}", file.path.display()));
                continue;
            }

            let age_days = file.age(now).as_secs() / 86_400;
            let metadata = json!({
                "path": self.layout.relative(&file.path),
                "size_bytes": file.size,
                "age_days": age_days,
                "retention_days": retention_days,
            });
            if let Err(e) = self.log_audit_event("audit_log_deleted", AUDIT_COMPONENT, to_map(metadata)) {
                report.errors.push(format!("deletion of {} not audited: {e}", file.path.display()));
            }
            info!(path = %file.path.display(), age_days, "[AUDIT] Deleted expired audit file");
            report.deleted.push(file.path);
        }

        report.directories_pruned = prune_empty_dirs(&self.layout.audit_root())?;
        Ok(report)
    }
}

enum Tail {
    Empty,
    Signed(String),
    Unreadable,
}

fn last_signature(path: &Path) -> Result<Tail> {
    let content = std::fs::read_to_string(path)?;
    let Some(line) = content.lines().rev().find(|l| !l.trim().is_empty()) else {
        return Ok(Tail::Empty);
    };
    let signature = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("signature_hash").and_then(Value::as_str).map(str::to_string));
    Ok(match signature {
        Some(s) => Tail::Signed(s),
        None => Tail::Unreadable,
    })
}

/// Parseable events of one file; malformed lines are skipped here (chain
/// verification is where they are reported).
fn read_events(path: &Path) -> Result<Vec<AuditEvent>> {
    let content = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => debug!(path = %path.display(), line = i + 1, error = %e, "[AUDIT] Skipping malformed line"),
        }
    }
    Ok(events)
}

/// Object form of `value`; anything else becomes `{"value": value}`.
pub fn to_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}
