//! Custom error types for the evidence vault.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Collection error ({component}): {message}")]
    Collection { component: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing field in backup payload: {0}")]
    MissingField(String),

    #[error("Integrity hash mismatch: stored {stored} matches none of {candidates} known schemes")]
    HashMismatch { stored: String, candidates: usize },

    #[error("Unsupported backup format version {found} (supported {min}..={max})")]
    UnsupportedFormat { found: u32, min: u32, max: u32 },

    #[error("Incremental chain cycle detected at {0}")]
    ChainCycle(PathBuf),

    #[error("Parent backup not found: {0}")]
    ParentMissing(PathBuf),

    #[error("Backup not found: {0}")]
    BackupNotFound(PathBuf),

    #[error("Audit error: {0}")]
    Audit(String),

    #[error("Invalid schema version: {0}")]
    InvalidVersion(String),

    #[error("Migration step must move forward: {from} -> {to}")]
    NonMonotonicStep { from: String, to: String },

    #[error("Migration step already registered: {from} -> {to}")]
    DuplicateStep { from: String, to: String },

    #[error("No migration path from {from} to {to}")]
    NoMigrationPath { from: String, to: String },

    #[error("Workspace is locked: {0}")]
    Locked(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;
