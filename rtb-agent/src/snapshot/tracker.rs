//! Reference counting for one shared snapshot.
//!
//! The tracker itself holds one reference. Every [`SnapshotReference`]
//! holds another, and the snapshot is destroyed when the last of them is
//! dropped. A reference is released by dropping or consuming it, so it
//! cannot be released twice.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

use super::SnapshotHandle;
use crate::utils::sync::lock;

struct TrackerState {
    handle: Option<Box<dyn SnapshotHandle>>,
    references: usize,
}

struct TrackerShared {
    name: String,
    state: Mutex<TrackerState>,
}

impl TrackerShared {
    /// Drops one reference; destroys the snapshot when none remain.
    fn release(&self) {
        let handle = {
            let mut state = lock(&self.state);
            state.references = state.references.saturating_sub(1);
            if state.references > 0 {
                return;
            }
            state.handle.take()
        };

        if let Some(handle) = handle {
            match handle.destroy() {
                Ok(()) => debug!(snapshot = %self.name, "Destroyed snapshot"),
                Err(e) => error!(snapshot = %self.name, error = %e, "Failed to destroy snapshot"),
            }
        }
    }
}

pub struct SnapshotReferenceTracker {
    shared: Arc<TrackerShared>,
}

impl SnapshotReferenceTracker {
    pub fn new(handle: Box<dyn SnapshotHandle>) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                name: handle.name().to_string(),
                state: Mutex::new(TrackerState {
                    handle: Some(handle),
                    references: 1,
                }),
            }),
        }
    }

    pub fn snapshot_name(&self) -> &str {
        &self.shared.name
    }

    /// Outstanding references, not counting the tracker's own.
    pub fn reference_count(&self) -> usize {
        lock(&self.shared.state).references.saturating_sub(1)
    }

    pub fn add_reference(&self, path: impl Into<String>) -> SnapshotReference {
        let path = path.into();
        let snapshotted_path = {
            let mut state = lock(&self.shared.state);
            state.references += 1;
            match &state.handle {
                Some(handle) => handle.build_path(Path::new(&path)),
                None => PathBuf::from(&path),
            }
        };

        SnapshotReference {
            shared: Arc::clone(&self.shared),
            path,
            snapshotted_path,
        }
    }
}

impl Drop for SnapshotReferenceTracker {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// A path bound to one snapshot, keeping that snapshot alive.
pub struct SnapshotReference {
    shared: Arc<TrackerShared>,
    path: String,
    snapshotted_path: PathBuf,
}

impl SnapshotReference {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path's location inside the snapshot.
    pub fn snapshotted_path(&self) -> &Path {
        &self.snapshotted_path
    }

    pub fn snapshot_name(&self) -> &str {
        &self.shared.name
    }

    pub fn release(self) {}
}

impl Drop for SnapshotReference {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl fmt::Debug for SnapshotReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotReference")
            .field("path", &self.path)
            .field("snapshot", &self.shared.name)
            .finish()
    }
}
