//! Directory traversal over backup and audit trees.
//!
//! Stray `.tmp` files left behind by interrupted atomic writes are skipped by
//! default so they never show up as backups or audit files.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Only keep files with this extension (without the dot)
    pub extension: Option<String>,

    /// Skip `*.tmp` leftovers
    pub skip_temp: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_depth: None,
            extension: None,
            skip_temp: true,
        }
    }
}

impl WalkOptions {
    pub fn with_extension(extension: &str) -> Self {
        Self {
            extension: Some(extension.to_string()),
            ..Self::default()
        }
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
            modified: metadata.modified()?,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Age relative to `now`; files from the future count as age zero.
    pub fn age(&self, now: SystemTime) -> std::time::Duration {
        now.duration_since(self.modified).unwrap_or_default()
    }
}

/// Walk a directory tree and collect all regular files.
///
/// A missing root yields an empty list rather than an error: a workspace
/// that never produced backups or audit events simply has nothing to list.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }

    let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    for entry in walker {
        let entry = entry?;

        if !entry.file_type().is_file() || should_skip(&entry, options) {
            continue;
        }

        files.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(files)
}

/// Remove empty directories below `root`, deepest first. `root` itself is kept.
pub fn prune_empty_dirs(root: &Path) -> std::io::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let is_empty = std::fs::read_dir(entry.path())?.next().is_none();
        if is_empty {
            std::fs::remove_dir(entry.path())?;
            removed += 1;
        }
    }

    Ok(removed)
}

fn should_skip(entry: &DirEntry, options: &WalkOptions) -> bool {
    let file_name = entry.file_name().to_string_lossy();

    if options.skip_temp && file_name.ends_with(".tmp") {
        return true;
    }

    match &options.extension {
        Some(ext) => entry.path().extension().map(|e| e != ext.as_str()).unwrap_or(true),
        None => false,
    }
}
