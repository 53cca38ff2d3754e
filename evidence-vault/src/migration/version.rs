//! Schema versions and on-disk version detection.

use crate::fs::{AtomicWriter, StorageLayout};
use crate::utils::{Result, VaultError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tracing::debug;

/// Schema written by this build.
pub const CURRENT_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(3, 0, 0);

/// Version implied by the flat legacy layout.
pub const LEGACY_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(1, 0, 0);

/// `[v]MAJOR[.MINOR[.PATCH]]`, ordered numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for SchemaVersion {
    type Err = VaultError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || VaultError::InvalidVersion(raw.to_string());
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if digits.is_empty() {
            return Err(invalid());
        }

        let mut parts = [0u32; 3];
        let mut count = 0;
        for part in digits.split('.') {
            if count == 3 || part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            parts[count] = part.parse().map_err(|_| invalid())?;
            count += 1;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = VaultError;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl From<SchemaVersion> for String {
    fn from(version: SchemaVersion) -> Self {
        version.to_string()
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Schema version of the workspace, checked in order: `version.txt`, the
/// `schema_version` field of `metadata.json`, then the flat legacy layout.
/// `None` when nothing identifies the workspace.
pub fn detect_version(layout: &StorageLayout) -> Result<Option<SchemaVersion>> {
    let marker = layout.version_marker();
    if marker.is_file() {
        let raw = std::fs::read_to_string(&marker)?;
        let version = raw.trim().parse()?;
        debug!("[MIGRATION] {} declares {}", marker.display(), version);
        return Ok(Some(version));
    }

    let metadata = layout.metadata_file();
    if metadata.is_file() {
        let value: Value = serde_json::from_slice(&std::fs::read(&metadata)?)?;
        if let Some(raw) = value.get("schema_version").and_then(Value::as_str) {
            let version = raw.parse()?;
            debug!("[MIGRATION] {} declares {}", metadata.display(), version);
            return Ok(Some(version));
        }
    }

    if layout.legacy_snapshot_file().is_file() || layout.legacy_state_file().is_file() {
        debug!("[MIGRATION] Legacy flat layout found");
        return Ok(Some(LEGACY_SCHEMA_VERSION));
    }

    Ok(None)
}

pub fn write_version_marker(layout: &StorageLayout, writer: &AtomicWriter, version: SchemaVersion) -> Result<()> {
    writer.write(&layout.version_marker(), format!("{version}\n").as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_accepts_short_forms() -> Result<()> {
        let full: SchemaVersion = "1.0.0".parse()?;
        assert_eq!("1".parse::<SchemaVersion>()?, full);
        assert_eq!("v1.0".parse::<SchemaVersion>()?, full);
        assert_eq!(" 2.10.3 ".parse::<SchemaVersion>()?, SchemaVersion::new(2, 10, 3));
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for raw in ["", "v", "1..0", "1.0.0.0", "1.x", "-1", "1.0-beta"] {
            assert!(raw.parse::<SchemaVersion>().is_err(), "{raw:?} parsed");
        }
    }

    #[test]
    fn test_ordering_is_numeric() -> Result<()> {
        assert!("2.0.0".parse::<SchemaVersion>()? < "10.0.0".parse()?);
        assert!("1.9".parse::<SchemaVersion>()? < "1.10".parse()?);
        Ok(())
    }

    #[test]
    fn test_detect_version_precedence() -> Result<()> {
        let dir = TempDir::new()?;
        let layout = StorageLayout::new(dir.path());
        assert_eq!(detect_version(&layout)?, None);

        std::fs::write(layout.legacy_state_file(), "{}")?;
        assert_eq!(detect_version(&layout)?, Some(LEGACY_SCHEMA_VERSION));

        std::fs::write(layout.metadata_file(), r#"{"schema_version": "2.0.0"}"#)?;
        assert_eq!(detect_version(&layout)?, Some(SchemaVersion::new(2, 0, 0)));

        write_version_marker(&layout, &AtomicWriter::default(), CURRENT_SCHEMA_VERSION)?;
        assert_eq!(detect_version(&layout)?, Some(CURRENT_SCHEMA_VERSION));
        Ok(())
    }

    #[test]
    fn test_serde_uses_string_form() -> Result<()> {
        let json = serde_json::to_string(&SchemaVersion::new(2, 1, 0))?;
        assert_eq!(json, "\"2.1.0\"");
        assert!(serde_json::from_str::<SchemaVersion>("\"nope\"").is_err());
        Ok(())
    }
}
