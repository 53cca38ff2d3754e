//! Utility modules for the evidence vault.

pub mod errors;
pub mod logger;

pub use errors::{Result, VaultError};
