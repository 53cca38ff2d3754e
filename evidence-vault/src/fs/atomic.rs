//! Atomic file replacement.
//!
//! Content is written to `<path>.tmp`, flushed to disk and renamed over the
//! destination, so readers see either the old file or the new one. Rename
//! failures caused by permission or lock contention are retried with a short
//! linear backoff. When every attempt fails the content is written directly
//! to the destination, which is reported through [`WriteMode::Direct`] and a
//! warning.

use crate::config::WriteConfig;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// How a write reached disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// temp file + rename
    Atomic,
    /// Fallback after exhausting retries; a crash mid-write can leave a partial file
    Direct,
}

#[derive(Debug, Clone)]
pub struct AtomicWriter {
    retries: u32,
    backoff: Duration,
}

impl Default for AtomicWriter {
    fn default() -> Self {
        Self::from_config(&WriteConfig::default())
    }
}

impl AtomicWriter {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self {
            retries: retries.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &WriteConfig) -> Self {
        Self::new(config.retries, Duration::from_millis(config.backoff_ms))
    }

    /// Replace `path` with `bytes`, creating parent directories as needed.
    pub fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<WriteMode> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = temp_path(path);
        let mut last_err = None;

        for attempt in 1..=self.retries {
            match write_and_rename(&tmp, path, bytes) {
                Ok(()) => return Ok(WriteMode::Atomic),
                Err(e) if is_contention(&e) => {
                    debug!(
                        path = %path.display(),
                        attempt,
                        error = %e,
                        "Atomic write contended, retrying"
                    );
                    last_err = Some(e);
                    std::thread::sleep(self.backoff * attempt);
                }
                Err(e) => {
                    let _ = fs::remove_file(&tmp);
                    return Err(e);
                }
            }
        }

        warn!(
            path = %path.display(),
            error = %last_err.map(|e| e.to_string()).unwrap_or_default(),
            "Atomic rename failed after {} attempts, writing directly (not crash-safe)",
            self.retries
        );
        let _ = fs::remove_file(&tmp);
        write_synced(path, bytes)?;
        Ok(WriteMode::Direct)
    }

    /// Serialize `value` as pretty JSON and write it atomically.
    pub fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> io::Result<WriteMode> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write(path, &bytes)
    }
}

/// Temporary sibling used for the write-then-rename step.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_and_rename(tmp: &Path, dest: &Path, bytes: &[u8]) -> io::Result<()> {
    write_synced(tmp, bytes)?;
    fs::rename(tmp, dest)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn is_contention(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_creates_parents_and_leaves_no_temp() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("a/b/c.json");

        let mode = AtomicWriter::default().write(&path, b"{\"k\":1}")?;

        assert_eq!(mode, WriteMode::Atomic);
        assert_eq!(fs::read(&path)?, b"{\"k\":1}");
        assert!(!temp_path(&path).exists());
        Ok(())
    }

    #[test]
    fn test_write_replaces_existing_content() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("file.txt");
        let writer = AtomicWriter::default();

        writer.write(&path, b"first version, longer")?;
        writer.write(&path, b"second")?;

        assert_eq!(fs::read_to_string(&path)?, "second");
        Ok(())
    }

    #[test]
    fn test_stray_temp_file_is_tolerated() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        fs::write(temp_path(&path), b"partial garbage from a killed run")?;

        AtomicWriter::default().write(&path, b"fresh")?;

        assert_eq!(fs::read_to_string(&path)?, "fresh");
        Ok(())
    }

    #[test]
    fn test_temp_path_appends_suffix() {
        assert_eq!(
            temp_path(Path::new("/x/audit_20240101_001.jsonl")),
            PathBuf::from("/x/audit_20240101_001.jsonl.tmp")
        );
    }
}
