//! Surface-area traversal for initial backups and periodic rescans.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Exclude patterns, matched as substrings of each entry's file name
    pub exclude_patterns: Vec<String>,
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: DateTime<Utc>,
}

impl FileInfo {
    /// Symlinks and anything that is not a regular file are skipped.
    fn from_entry(entry: &DirEntry) -> std::io::Result<Option<Self>> {
        if !entry.file_type().is_file() {
            return Ok(None);
        }

        let metadata = entry.metadata()?;
        Ok(Some(Self {
            path: entry.path().to_path_buf(),
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
        }))
    }

    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Walk every root and call `callback` for each regular file.
///
/// Unreadable entries are skipped; only an unreadable root is an error.
pub fn walk_roots_with_callback<F>(
    roots: &[PathBuf],
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(FileInfo),
{
    for root in roots {
        std::fs::metadata(root)?;

        let walker = WalkDir::new(root)
            .follow_links(false)
            .same_file_system(true)
            .into_iter()
            .filter_entry(|entry| !should_exclude(entry, &options.exclude_patterns));

        for entry in walker.flatten() {
            if let Ok(Some(file_info)) = FileInfo::from_entry(&entry) {
                callback(file_info);
            }
        }
    }

    Ok(())
}

/// Collect every regular file under the given roots
pub fn walk_roots(roots: &[PathBuf], options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_roots_with_callback(roots, options, |file| files.push(file))?;
    Ok(files)
}

/// Whether `path` lies inside one of the roots.
pub fn is_within_roots(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    if entry.depth() == 0 {
        return false;
    }

    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}
