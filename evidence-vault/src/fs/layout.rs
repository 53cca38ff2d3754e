//! On-disk layout of an investigation workspace.
//!
//! ```text
//! <root>/
//!   version.txt
//!   metadata.json
//!   snapshot/snapshot.json
//!   state/current.json
//!   backups/{full,incremental,emergency}/backup_<YYYYMMDD>_<HHMMSS>_<type>.json
//!   backups/manifests/<backup stem>.manifest.json
//!   audit_logs/<component>/<YYYY>/<MM>/audit_<YYYYMMDD>_<NNN>.jsonl
//! ```
//!
//! Backup and audit file names are shared with existing workspaces and must
//! not change.

use crate::backup::BackupType;
use chrono::{NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};

pub const BACKUPS_DIR: &str = "backups";
pub const MANIFESTS_DIR: &str = "manifests";
pub const AUDIT_DIR: &str = "audit_logs";
pub const VERSION_MARKER: &str = "version.txt";
pub const METADATA_FILE: &str = "metadata.json";
pub const LOCK_FILE: &str = ".vault.lock";

pub const SNAPSHOT_DIR: &str = "snapshot";
pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const STATE_DIR: &str = "state";
pub const STATE_FILE: &str = "current.json";

/// Flat files of the oldest workspace layout.
pub const LEGACY_SNAPSHOT_FILE: &str = "observations.json";
pub const LEGACY_STATE_FILE: &str = "state.json";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backups_root(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    pub fn backup_dir(&self, backup_type: BackupType) -> PathBuf {
        self.backups_root().join(backup_type.as_str())
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.backups_root().join(MANIFESTS_DIR)
    }

    /// Manifest written alongside `backup_path`.
    pub fn manifest_path_for(&self, backup_path: &Path) -> PathBuf {
        let stem = backup_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        self.manifests_dir().join(format!("{stem}.manifest.json"))
    }

    pub fn audit_root(&self) -> PathBuf {
        self.root.join(AUDIT_DIR)
    }

    pub fn audit_component_dir(&self, component: &str) -> PathBuf {
        self.audit_root().join(sanitize_component(component))
    }

    pub fn audit_month_dir(&self, component: &str, date: NaiveDate) -> PathBuf {
        self.audit_component_dir(component)
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
    }

    pub fn version_marker(&self) -> PathBuf {
        self.root.join(VERSION_MARKER)
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.root.join(SNAPSHOT_DIR).join(SNAPSHOT_FILE)
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_DIR).join(STATE_FILE)
    }

    pub fn legacy_snapshot_file(&self) -> PathBuf {
        self.root.join(LEGACY_SNAPSHOT_FILE)
    }

    pub fn legacy_state_file(&self) -> PathBuf {
        self.root.join(LEGACY_STATE_FILE)
    }

    /// Create `backups/<type>/` for every type plus the manifest directory.
    pub fn ensure_backup_dirs(&self) -> std::io::Result<()> {
        for backup_type in BackupType::ALL {
            std::fs::create_dir_all(self.backup_dir(backup_type))?;
        }
        std::fs::create_dir_all(self.manifests_dir())
    }

    /// Path as stored inside payloads: relative to the root when possible.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Inverse of [`relative`](Self::relative); absolute paths pass through.
    pub fn resolve(&self, stored: &str) -> PathBuf {
        let path = Path::new(stored);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Resolve a stored backup reference, following backups that were moved
    /// from the flat `backups/` directory into their typed subdirectory.
    pub fn locate_backup(&self, stored: &str) -> PathBuf {
        let path = self.resolve(stored);
        if path.exists() {
            return path;
        }
        let relocated = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| {
                let (_, backup_type) = parse_backup_file_name(name)?;
                Some(self.backup_dir(backup_type).join(name))
            });
        match relocated {
            Some(candidate) if candidate.exists() => candidate,
            _ => path,
        }
    }
}

/// `backup_<YYYYMMDD>_<HHMMSS>_<type>.json`, with `_<n>` appended when the
/// plain name is already taken.
pub fn backup_file_name(at: NaiveDateTime, backup_type: BackupType, collision: u32) -> String {
    let base = format!(
        "backup_{}_{}",
        at.format("%Y%m%d_%H%M%S"),
        backup_type.as_str()
    );
    if collision == 0 {
        format!("{base}.json")
    } else {
        format!("{base}_{collision}.json")
    }
}

/// Parse the timestamp and type out of a backup file name.
pub fn parse_backup_file_name(name: &str) -> Option<(NaiveDateTime, BackupType)> {
    let stem = name.strip_prefix("backup_")?.strip_suffix(".json")?;
    let mut parts = stem.splitn(4, '_');
    let date = parts.next()?;
    let time = parts.next()?;
    let kind = parts.next()?;
    if let Some(suffix) = parts.next() {
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }
    let at = NaiveDateTime::parse_from_str(&format!("{date}{time}"), "%Y%m%d%H%M%S").ok()?;
    let backup_type = kind.parse().ok()?;
    Some((at, backup_type))
}

/// `audit_<YYYYMMDD>_<NNN>.jsonl`
pub fn audit_file_name(date: NaiveDate, sequence: u32) -> String {
    format!("audit_{}_{:03}.jsonl", date.format("%Y%m%d"), sequence)
}

/// Sequence number of an audit file written on `date`.
pub fn parse_audit_sequence(name: &str, date: NaiveDate) -> Option<u32> {
    let prefix = format!("audit_{}_", date.format("%Y%m%d"));
    name.strip_prefix(&prefix)?
        .strip_suffix(".jsonl")?
        .parse()
        .ok()
}

/// Component names become directory names; anything outside
/// `[A-Za-z0-9_-]` is replaced.
pub fn sanitize_component(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Free bytes on the volume holding `path`, walking up to the nearest
/// existing ancestor.
pub fn available_space(path: &Path) -> Option<u64> {
    let mut probe = Some(path);
    while let Some(candidate) = probe {
        if candidate.exists() {
            return fs2::available_space(candidate).ok();
        }
        probe = candidate.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|d| d.and_hms_opt(14, 5, 7))
            .unwrap()
    }

    #[test]
    fn test_backup_file_name_format() {
        assert_eq!(
            backup_file_name(at(), BackupType::Full, 0),
            "backup_20240309_140507_full.json"
        );
        assert_eq!(
            backup_file_name(at(), BackupType::Incremental, 2),
            "backup_20240309_140507_incremental_2.json"
        );
    }

    #[test]
    fn test_parse_backup_file_name() {
        assert_eq!(
            parse_backup_file_name("backup_20240309_140507_emergency.json"),
            Some((at(), BackupType::Emergency))
        );
        assert_eq!(
            parse_backup_file_name("backup_20240309_140507_full_3.json"),
            Some((at(), BackupType::Full))
        );
        assert_eq!(parse_backup_file_name("backup_20240309_140507_weekly.json"), None);
        assert_eq!(parse_backup_file_name("notes.json"), None);
        assert_eq!(
            parse_backup_file_name("backup_20240309_140507_full.manifest.json"),
            None
        );
    }

    #[test]
    fn test_audit_file_names() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(audit_file_name(date, 1), "audit_20240131_001.jsonl");
        assert_eq!(parse_audit_sequence("audit_20240131_012.jsonl", date), Some(12));
        assert_eq!(parse_audit_sequence("audit_20240130_012.jsonl", date), None);
    }

    #[test]
    fn test_audit_month_dir() {
        let layout = StorageLayout::new("/ws");
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(
            layout.audit_month_dir("backup", date),
            PathBuf::from("/ws/audit_logs/backup/2024/01")
        );
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("restore"), "restore");
        assert_eq!(sanitize_component("../etc"), "___etc");
        assert_eq!(sanitize_component(""), "unknown");
    }

    #[test]
    fn test_relative_roundtrip() {
        let layout = StorageLayout::new("/ws");
        let path = Path::new("/ws/backups/full/backup_20240309_140507_full.json");
        let stored = layout.relative(path);
        assert_eq!(stored, "backups/full/backup_20240309_140507_full.json");
        assert_eq!(layout.resolve(&stored), path);
    }

    #[test]
    fn test_locate_backup_follows_relocation() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let layout = StorageLayout::new(dir.path());
        let flat = "backups/backup_20240309_140507_full.json";
        assert_eq!(layout.locate_backup(flat), dir.path().join(flat));

        let moved = layout.backup_dir(BackupType::Full).join("backup_20240309_140507_full.json");
        std::fs::create_dir_all(moved.parent().unwrap())?;
        std::fs::write(&moved, "{}")?;
        assert_eq!(layout.locate_backup(flat), moved);
        Ok(())
    }
}
