//! ZFS snapshots through the `zfs` command.
//!
//! A snapshot `dataset@name` is readable under
//! `<mount_point>/.zfs/snapshot/<name>`.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

use super::{SnapshotHandle, SnapshotProvider};
use crate::utils::errors::{AgentError, Result};

pub struct ZfsSnapshotProvider {
    dataset: String,
    mount_point: PathBuf,
}

impl ZfsSnapshotProvider {
    pub fn new(dataset: impl Into<String>, mount_point: impl AsRef<Path>) -> Self {
        Self {
            dataset: dataset.into(),
            mount_point: mount_point.as_ref().to_path_buf(),
        }
    }

    fn handle(&self, name: &str) -> ZfsSnapshot {
        ZfsSnapshot {
            full_name: format!("{}@{}", self.dataset, name),
            name: name.to_string(),
            mount_point: self.mount_point.clone(),
            root: self.mount_point.join(".zfs").join("snapshot").join(name),
        }
    }
}

fn run_zfs(args: &[&str]) -> Result<()> {
    let output = Command::new("zfs").args(args).output()?;
    if output.status.success() {
        return Ok(());
    }

    Err(AgentError::Snapshot(format!(
        "zfs {} failed ({}): {}",
        args.join(" "),
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

impl SnapshotProvider for ZfsSnapshotProvider {
    fn create_snapshot(&self, name: &str) -> Result<Box<dyn SnapshotHandle>> {
        let handle = self.handle(name);
        run_zfs(&["snapshot", &handle.full_name])?;
        info!(snapshot = %handle.full_name, "Created ZFS snapshot");
        Ok(Box::new(handle))
    }
}

struct ZfsSnapshot {
    full_name: String,
    name: String,
    mount_point: PathBuf,
    root: PathBuf,
}

impl SnapshotHandle for ZfsSnapshot {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.mount_point) {
            Ok(relative) => self.root.join(relative),
            // Outside the dataset: nothing to redirect to
            Err(_) => path.to_path_buf(),
        }
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        run_zfs(&["destroy", &self.full_name])
    }
}
