//! Wiring a [`BackupAgent`] from configuration, and process lifecycle.

pub mod shutdown;

use std::sync::Arc;
use tracing::info;

use crate::agent::{AgentCollaborators, BackupAgent};
use crate::config::Config;
use crate::fs::checksum::Blake3Checksum;
use crate::fs::open_handles::ProcOpenFileHandles;
use crate::fs::staging::TempDirStaging;
use crate::snapshot::provider_from_config;
use crate::state::{LocalBatchStorage, RemoteFileStateCache};
use crate::storage::{LocalDirectoryStorage, RemoteStorage};
use crate::utils::errors::Result;

/// Build an agent backed by the local batch directory, the configured
/// storage root and snapshot provider.
pub fn build_agent(config: &Config) -> Result<Arc<BackupAgent>> {
    let storage: Arc<dyn RemoteStorage> = Arc::new(LocalDirectoryStorage::new(&config.storage.root)?);
    let batches = Arc::new(LocalBatchStorage::new(config.state_dir())?);
    let cache = Arc::new(RemoteFileStateCache::load(
        batches,
        Arc::clone(&storage),
        config.state_cache.clone(),
    )?);
    info!(
        tracked = cache.len(),
        current_batch = cache.current_batch_number(),
        "State cache loaded"
    );

    let collaborators = AgentCollaborators {
        snapshots: provider_from_config(&config.snapshot)?,
        open_handles: Arc::new(ProcOpenFileHandles::new()),
        staging: Arc::new(TempDirStaging::new(config.staging_dir())?),
        checksum: Arc::new(Blake3Checksum),
        storage,
        cache,
    };

    Ok(Arc::new(BackupAgent::new(config.pipeline.clone(), collaborators)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotProviderKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_build_agent_creates_directories() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.agent.data_dir = dir.path().join("data");
        config.storage.root = dir.path().join("remote");
        config.snapshot.provider = SnapshotProviderKind::Live;

        let agent = build_agent(&config).unwrap();

        assert!(config.state_dir().is_dir());
        assert!(config.staging_dir().is_dir());
        assert!(config.storage.root.is_dir());
        assert!(agent.cache().is_empty());
    }

    #[test]
    fn test_zfs_without_dataset_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.agent.data_dir = dir.path().join("data");
        config.storage.root = dir.path().join("remote");
        config.snapshot.provider = SnapshotProviderKind::Zfs;
        config.snapshot.dataset = String::new();

        assert!(build_agent(&config).is_err());
    }
}
