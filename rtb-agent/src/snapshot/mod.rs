//! Point-in-time snapshots and their shared reference counting.

pub mod live;
pub mod tracker;
pub mod zfs;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{SnapshotConfig, SnapshotProviderKind};
use crate::state::file_state::to_ticks;
use crate::utils::errors::{AgentError, Result};

pub use live::LiveSnapshotProvider;
pub use tracker::{SnapshotReference, SnapshotReferenceTracker};
pub use zfs::ZfsSnapshotProvider;

/// A snapshot that exists until destroyed.
pub trait SnapshotHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Where `path` can be read inside this snapshot.
    fn build_path(&self, path: &Path) -> PathBuf;

    fn destroy(self: Box<Self>) -> Result<()>;
}

pub trait SnapshotProvider: Send + Sync {
    fn create_snapshot(&self, name: &str) -> Result<Box<dyn SnapshotHandle>>;
}

/// `RTB-<ticks>`, unique per 100ns.
pub fn snapshot_name(at: DateTime<Utc>) -> Result<String> {
    Ok(format!("RTB-{}", to_ticks(&at)?))
}

/// Create a snapshot named for the current time and wrap it in a tracker.
pub fn take_shared_snapshot(provider: &dyn SnapshotProvider) -> Result<SnapshotReferenceTracker> {
    let handle = provider.create_snapshot(&snapshot_name(Utc::now())?)?;
    Ok(SnapshotReferenceTracker::new(handle))
}

pub fn provider_from_config(config: &SnapshotConfig) -> Result<Arc<dyn SnapshotProvider>> {
    match config.provider {
        SnapshotProviderKind::Live => Ok(Arc::new(LiveSnapshotProvider)),
        SnapshotProviderKind::Zfs => {
            if config.dataset.is_empty() {
                return Err(AgentError::Config(
                    "snapshot.dataset is required for the zfs provider".to_string(),
                ));
            }
            Ok(Arc::new(ZfsSnapshotProvider::new(
                config.dataset.clone(),
                &config.mount_point,
            )))
        }
    }
}
