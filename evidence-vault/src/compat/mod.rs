//! Backup/restore compatibility layer: validation across historical formats
//! and incremental chain materialization.

pub mod chain;
pub mod validate;

pub use chain::{materialize, materialize_validated, MaterializedBackup};
pub use validate::{parse_timestamp, validate_backup_file, BackupInfo, ValidatedBackup};
