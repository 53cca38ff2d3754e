//! Configuration management for the evidence vault.
//!
//! Loads configuration from a TOML file; every field has a default so a
//! partial file (or no file at all) yields a usable configuration.

use crate::utils::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding `storage.root`.
pub const ROOT_ENV_VAR: &str = "EVIDENCE_VAULT_ROOT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub write: WriteConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Investigation workspace root (backups/, audit_logs/, version.txt)
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Backups of the same type older than this are removed after a new backup
    #[serde(default = "default_backup_retention_days")]
    pub retention_days: u32,

    /// Warn when the backup volume has less free space than this
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Run retention cleanup after every successful backup
    #[serde(default = "default_true")]
    pub cleanup_after_backup: bool,
}

/// What the restore engine does when the state restore fails after the
/// snapshot was already written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Write the checkpoint's snapshot back automatically
    Automatic,
    /// Leave the workspace as is and report the checkpoint for manual recovery
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Take an emergency checkpoint of live data before restoring
    #[serde(default = "default_true")]
    pub checkpoint: bool,

    #[serde(default = "default_rollback")]
    pub rollback: RollbackPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Rotate to a new numbered file once the active one reaches this size
    #[serde(default = "default_audit_max_file_bytes")]
    pub max_file_bytes: u64,

    #[serde(default = "default_audit_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    /// Rename attempts before falling back to a direct write
    #[serde(default = "default_write_retries")]
    pub retries: u32,

    /// Linear backoff step between attempts
    #[serde(default = "default_write_backoff_ms")]
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output (stderr, stdout)
    #[serde(default = "default_log_output")]
    pub output: String,
}

// Default values
fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_backup_retention_days() -> u32 {
    30
}

fn default_min_free_bytes() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_true() -> bool {
    true
}

fn default_rollback() -> RollbackPolicy {
    RollbackPolicy::Automatic
}

fn default_audit_max_file_bytes() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_audit_retention_days() -> u32 {
    365
}

fn default_write_retries() -> u32 {
    3
}

fn default_write_backoff_ms() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stderr".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { root: default_root() }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention_days: default_backup_retention_days(),
            min_free_bytes: default_min_free_bytes(),
            cleanup_after_backup: true,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            checkpoint: true,
            rollback: default_rollback(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_audit_max_file_bytes(),
            retention_days: default_audit_retention_days(),
        }
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            retries: default_write_retries(),
            backoff_ms: default_write_backoff_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
        }
    }
}

impl VaultConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: VaultConfig = toml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Configuration rooted at `root`, everything else default
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.root = root.into();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(root) = std::env::var(ROOT_ENV_VAR) {
            if !root.trim().is_empty() {
                self.storage.root = PathBuf::from(root);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.audit.max_file_bytes == 0 {
            return Err(VaultError::Config(
                "audit.max_file_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
