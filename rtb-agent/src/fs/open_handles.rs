//! Enumerates open file handles so files mid-write are never uploaded torn.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Access mode of an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
    ReadWrite,
}

impl FileAccess {
    pub fn can_write(self) -> bool {
        matches!(self, FileAccess::Write | FileAccess::ReadWrite)
    }

    /// Decode the `O_ACCMODE` bits of an open flags word.
    pub fn from_open_flags(flags: u32) -> Self {
        match flags & 0o3 {
            0o1 => FileAccess::Write,
            0o2 => FileAccess::ReadWrite,
            _ => FileAccess::Read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFileHandle {
    pub process_id: u32,
    pub file_descriptor: u32,
    pub access: FileAccess,
}

/// Lists the handles currently open on a path.
pub trait OpenFileHandles: Send + Sync {
    fn enumerate(&self, path: &Path) -> io::Result<Vec<OpenFileHandle>>;
}

/// Whether any process holds a write-capable handle on `path`.
///
/// Enumeration failures count as "open": the file is deferred, not uploaded.
pub fn is_open_for_write(handles: &dyn OpenFileHandles, path: &Path) -> bool {
    match handles.enumerate(path) {
        Ok(handles) => handles.iter().any(|handle| handle.access.can_write()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Could not enumerate open handles");
            true
        }
    }
}

/// Scans `/proc/<pid>/fd` and `/proc/<pid>/fdinfo`.
pub struct ProcOpenFileHandles {
    proc_root: PathBuf,
}

impl ProcOpenFileHandles {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn handles_of_process(&self, pid: u32, target: &Path, found: &mut Vec<OpenFileHandle>) {
        let process_dir = self.proc_root.join(pid.to_string());

        // Processes come and go and some are not ours to inspect.
        let Ok(entries) = fs::read_dir(process_dir.join("fd")) else {
            return;
        };

        for entry in entries.flatten() {
            let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };

            match fs::read_link(entry.path()) {
                Ok(link) if link == target => {}
                _ => continue,
            }

            let access = fs::read_to_string(process_dir.join("fdinfo").join(fd.to_string()))
                .ok()
                .and_then(|info| parse_fdinfo_flags(&info))
                .map(FileAccess::from_open_flags)
                .unwrap_or(FileAccess::ReadWrite);

            found.push(OpenFileHandle {
                process_id: pid,
                file_descriptor: fd,
                access,
            });
        }
    }
}

impl Default for ProcOpenFileHandles {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileHandles for ProcOpenFileHandles {
    fn enumerate(&self, path: &Path) -> io::Result<Vec<OpenFileHandle>> {
        let mut found = Vec::new();

        for entry in fs::read_dir(&self.proc_root)? {
            let entry = entry?;
            if let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                self.handles_of_process(pid, path, &mut found);
            }
        }

        Ok(found)
    }
}

/// Extract the octal `flags:` field from an fdinfo file.
fn parse_fdinfo_flags(info: &str) -> Option<u32> {
    info.lines()
        .find_map(|line| line.strip_prefix("flags:"))
        .and_then(|value| u32::from_str_radix(value.trim(), 8).ok())
}
