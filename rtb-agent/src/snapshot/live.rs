//! Pass-through provider for filesystems without snapshot support.
//!
//! Reads go to the live file, so only the open-handle checks protect
//! against torn copies.

use std::path::{Path, PathBuf};

use super::{SnapshotHandle, SnapshotProvider};
use crate::utils::errors::Result;

pub struct LiveSnapshotProvider;

impl SnapshotProvider for LiveSnapshotProvider {
    fn create_snapshot(&self, name: &str) -> Result<Box<dyn SnapshotHandle>> {
        Ok(Box::new(LiveSnapshot {
            name: name.to_string(),
        }))
    }
}

struct LiveSnapshot {
    name: String,
}

impl SnapshotHandle for LiveSnapshot {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_path(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
