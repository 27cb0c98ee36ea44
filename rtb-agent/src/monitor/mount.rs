//! Mounts under backup and the collaborators that open them.

use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::errors::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub device_name: String,
    /// Root of the mount within its filesystem
    pub root: String,
    pub mount_point: String,
    pub file_system_type: String,
    pub options: String,
}

impl Mount {
    /// Whether the device is a node that can be opened on its own.
    /// Pool-backed filesystems such as ZFS name a dataset instead.
    pub fn test_device_access(&self) -> bool {
        self.device_name.starts_with('/') && Path::new(&self.device_name).exists()
    }
}

/// The set of mounts whose changes matter.
pub trait SurfaceArea: Send + Sync {
    fn mounts(&self) -> Vec<Mount>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountHandle {
    pub file_descriptor: i32,
    pub file_system_id: i64,
}

pub trait MountTable: Send + Sync {
    fn open_mount_for_file_system(&self, mount_point: &str) -> Result<MountHandle>;
}

/// Resolves a kernel directory handle, relative to a mount, to its path.
pub trait OpenByHandleAt: Send + Sync {
    fn open(&self, mount_descriptor: i32, file_handle: &[u8]) -> Result<PathBuf>;
}

const PSEUDO_FILE_SYSTEMS: &[&str] = &[
    "proc", "sysfs", "devtmpfs", "devpts", "tmpfs", "cgroup", "cgroup2", "securityfs",
    "debugfs", "tracefs", "pstore", "bpf", "mqueue", "hugetlbfs", "configfs", "fusectl",
    "autofs", "binfmt_misc", "overlay", "squashfs", "nsfs", "rpc_pipefs",
];

/// Mounts from `/proc/self/mountinfo` that hold or sit inside a backup root.
pub struct MountInfoSurfaceArea {
    roots: Vec<PathBuf>,
    mountinfo: PathBuf,
}

impl MountInfoSurfaceArea {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
        }
    }

    fn is_relevant(&self, mount: &Mount) -> bool {
        if PSEUDO_FILE_SYSTEMS.contains(&mount.file_system_type.as_str()) {
            return false;
        }
        let mount_point = Path::new(&mount.mount_point);
        self.roots
            .iter()
            .any(|root| root.starts_with(mount_point) || mount_point.starts_with(root))
    }

    /// Mounts that contain a root or are nested beneath one.
    pub fn load(&self) -> Result<Vec<Mount>> {
        let contents = fs::read_to_string(&self.mountinfo)?;
        let mut mounts = Vec::new();
        for line in contents.lines() {
            let mount = parse_mountinfo_line(line)?;
            if self.is_relevant(&mount) {
                mounts.push(mount);
            }
        }
        Ok(mounts)
    }
}

impl SurfaceArea for MountInfoSurfaceArea {
    fn mounts(&self) -> Vec<Mount> {
        match self.load() {
            Ok(mounts) => mounts,
            Err(e) => {
                tracing::error!(error = %e, "Could not read the mount table");
                Vec::new()
            }
        }
    }
}

/// `id parent major:minor root mount_point options [optional...] - type source super_options`
pub fn parse_mountinfo_line(line: &str) -> Result<Mount> {
    let malformed = || AgentError::Monitor(format!("malformed mountinfo line: {:?}", line));

    let (before, after) = line.split_once(" - ").ok_or_else(malformed)?;
    let before: Vec<&str> = before.split(' ').collect();
    let after: Vec<&str> = after.split(' ').collect();
    if before.len() < 6 || after.len() < 2 {
        return Err(malformed());
    }

    Ok(Mount {
        device_name: unescape(after[1]),
        root: unescape(before[3]),
        mount_point: unescape(before[4]),
        file_system_type: after[0].to_string(),
        options: before[5].to_string(),
    })
}

/// Undo the kernel's `\ooo` octal escaping of spaces and friends.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
