//! Evidence Vault Library
//!
//! Truth-preservation layer for investigation workspaces: hashed full and
//! incremental backups, validated restore with checkpoints, a hash-chained
//! audit log and a schema migration engine.

pub mod audit;
pub mod backup;
pub mod compat;
pub mod config;
pub mod context;
pub mod daemon;
pub mod fs;
pub mod integrity;
pub mod migration;
pub mod outcome;
pub mod restore;
pub mod stores;
pub mod utils;

// Re-export commonly used types
pub use audit::{AuditEvent, AuditLog, AuditQuery};
pub use backup::{BackupCreator, BackupOutcome, BackupType};
pub use config::VaultConfig;
pub use context::VaultContext;
pub use migration::{MigrationExecutor, MigrationRegistry, MigrationResult, MigrationStep, SchemaVersion};
pub use restore::{RestorationOutcome, RestoreEngine};
pub use utils::errors::VaultError;
pub type Result<T> = std::result::Result<T, VaultError>;
