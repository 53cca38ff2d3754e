//! Single-writer lock for a workspace.
//!
//! The backup and audit trees are not safe against two processes writing at
//! once. Mutating operator commands hold an advisory exclusive lock on
//! `<root>/.vault.lock` for their whole lifetime; the file carries the
//! holder's pid and host so contention errors are actionable.

use crate::utils::{Result, VaultError};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Metadata stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub command: String,
}

impl LockMetadata {
    pub fn current(command: &str) -> Self {
        Self {
            pid: std::process::id(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            started_at: Utc::now(),
            command: command.to_string(),
        }
    }
}

impl std::fmt::Display for LockMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PID {} on {} running '{}' since {}",
            self.pid,
            self.host,
            self.command,
            self.started_at.to_rfc3339()
        )
    }
}

/// Held lock; released on drop.
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
    metadata: LockMetadata,
}

impl WorkspaceLock {
    /// Take the lock or fail immediately with the current holder's details.
    pub fn acquire(lock_path: &Path, command: &str) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        if file.try_lock_exclusive().is_err() {
            let mut content = String::new();
            let _ = file.read_to_string(&mut content);
            let holder = serde_json::from_str::<LockMetadata>(&content)
                .map(|m| m.to_string())
                .unwrap_or_else(|_| "unknown holder".to_string());
            return Err(VaultError::Locked(format!(
                "{} is held by {}",
                lock_path.display(),
                holder
            )));
        }

        let metadata = LockMetadata::current(command);
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string_pretty(&metadata)?.as_bytes())?;
        file.sync_all()?;

        debug!(path = %lock_path.display(), "Workspace lock acquired");

        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
            metadata,
        })
    }

    pub fn metadata(&self) -> &LockMetadata {
        &self.metadata
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release workspace lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_until_drop() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(".vault.lock");

        let first = WorkspaceLock::acquire(&path, "backup")?;
        assert_eq!(first.metadata().pid, std::process::id());

        match WorkspaceLock::acquire(&path, "restore") {
            Err(VaultError::Locked(msg)) => assert!(msg.contains("backup")),
            other => panic!("expected lock contention, got {:?}", other.map(|_| ())),
        }

        drop(first);
        let again = WorkspaceLock::acquire(&path, "restore")?;
        assert_eq!(again.metadata().command, "restore");
        Ok(())
    }
}
