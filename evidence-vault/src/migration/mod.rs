//! Schema migration engine.
//!
//! Versions are detected from the workspace, a path is planned through the
//! registered steps and each step runs with its pre and post conditions.

pub mod builtin;
pub mod executor;
pub mod registry;
pub mod version;

pub use builtin::{default_registry, stamp_current_version};
pub use executor::{ConfirmFn, MigrationExecutor, MigrationResult, MIGRATION_AUDIT_COMPONENT};
pub use registry::{Condition, MigrationRegistry, MigrationStep, RegisteredStep, StepContext};
pub use version::{detect_version, SchemaVersion, CURRENT_SCHEMA_VERSION};
