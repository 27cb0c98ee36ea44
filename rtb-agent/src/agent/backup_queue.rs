//! Single consumer applying backup actions against the state cache and remote storage.

use std::io::{self, Seek, SeekFrom};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::action::{BackupAction, FileReference, UploadItem};
use super::queue::{InFlight, LifoQueue};
use super::upload::UploadPool;
use crate::fs::checksum::Checksum;
use crate::fs::staging::Staging;
use crate::snapshot::SnapshotReference;
use crate::state::{FileState, RemoteFileStateCache};
use crate::storage::{content_path, RemoteStorage};
use crate::utils::errors::{AgentError, Result};

pub struct BackupQueueStage {
    actions: LifoQueue<BackupAction>,
    in_flight: InFlight,
    cache: Arc<RemoteFileStateCache>,
    storage: Arc<dyn RemoteStorage>,
    checksum: Arc<dyn Checksum>,
    staging: Arc<dyn Staging>,
    /// Files up to this size are copied out so their snapshot can go.
    maximum_staging_size: u64,
}

impl BackupQueueStage {
    pub fn new(
        cache: Arc<RemoteFileStateCache>,
        storage: Arc<dyn RemoteStorage>,
        checksum: Arc<dyn Checksum>,
        staging: Arc<dyn Staging>,
        maximum_staging_size: u64,
    ) -> Self {
        Self {
            actions: LifoQueue::new(),
            in_flight: InFlight::default(),
            cache,
            storage,
            checksum,
            staging,
            maximum_staging_size,
        }
    }

    pub fn actions(&self) -> &LifoQueue<BackupAction> {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.in_flight.is_zero()
    }

    /// Apply actions newest first until stopped, then drain what is left
    /// unless `cancel` fires first.
    pub async fn run(
        &self,
        uploads: &UploadPool,
        stopping: &CancellationToken,
        cancel: &CancellationToken,
    ) {
        while let Some((action, _working)) = self.actions.pop_entered(stopping, &self.in_flight).await {
            if !self.apply_or_cancel(action, uploads, cancel).await {
                debug!("Backup queue cancelled");
                return;
            }
        }

        while let Some((action, _working)) = self.actions.try_pop_entered(&self.in_flight) {
            if !self.apply_or_cancel(action, uploads, cancel).await {
                debug!(remaining = self.actions.len(), "Backup queue cancelled while draining");
                return;
            }
        }
        debug!("Backup queue drained");
    }

    async fn apply_or_cancel(
        &self,
        action: BackupAction,
        uploads: &UploadPool,
        cancel: &CancellationToken,
    ) -> bool {
        let path = action.path().to_string();
        tokio::select! {
            result = self.apply(action, uploads, cancel) => {
                report(&path, result);
                true
            }
            _ = cancel.cancelled() => false,
        }
    }

    pub async fn apply(
        &self,
        action: BackupAction,
        uploads: &UploadPool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match action {
            BackupAction::Upload(reference) => {
                if let Some(item) = self.prepare_upload(reference).await? {
                    uploads.push(item);
                }
                Ok(())
            }
            BackupAction::Move { from, to } => self.apply_move(&from, &to, cancel).await,
            BackupAction::Delete { path } => self.apply_delete(&path, cancel).await,
        }
    }

    /// Checksum the snapshotted content; `None` when it matches the cache.
    async fn prepare_upload(&self, reference: SnapshotReference) -> Result<Option<UploadItem>> {
        let cache = Arc::clone(&self.cache);
        let checksum = Arc::clone(&self.checksum);
        let staging = Arc::clone(&self.staging);
        let maximum_staging_size = self.maximum_staging_size;

        tokio::task::spawn_blocking(move || {
            prepare_upload(reference, &cache, &*checksum, &*staging, maximum_staging_size)
        })
        .await?
    }

    async fn apply_move(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<()> {
        let state = self.cache.get_file_state(from).ok_or_else(|| AgentError::Consistency {
            path: from.to_string(),
        })?;

        self.storage
            .move_file(&content_path(from), &content_path(to), cancel)
            .await?;
        self.cache.move_file_state(from, to, state)?;
        info!(from = %from, to = %to, "Moved");
        Ok(())
    }

    async fn apply_delete(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        if !self.cache.remove_file_state(path)? {
            debug!(path = %path, "Delete of untracked path ignored");
            return Ok(());
        }

        self.storage.delete_file(&content_path(path), cancel).await?;
        info!(path = %path, "Deleted");
        Ok(())
    }
}

fn report(path: &str, result: Result<()>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_consistency_fault() => {
            error!(path = %path, error = %e, "State cache consistency fault");
        }
        Err(e) => warn!(path = %path, error = %e, "Backup action failed"),
    }
}

fn prepare_upload(
    reference: SnapshotReference,
    cache: &RemoteFileStateCache,
    checksum: &dyn Checksum,
    staging: &dyn Staging,
    maximum_staging_size: u64,
) -> Result<Option<UploadItem>> {
    let path = reference.path().to_string();
    let mut file = match std::fs::File::open(reference.snapshotted_path()) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path, "Gone before backup");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Ok(None);
    }

    let digest = checksum.compute_checksum(&mut file)?;
    if cache
        .get_file_state(&path)
        .is_some_and(|known| known.checksum == digest)
    {
        debug!(path = %path, "Content unchanged");
        return Ok(None);
    }

    let state = FileState {
        path: path.clone(),
        content_key: String::new(),
        file_size: metadata.len(),
        last_modified_utc: metadata.modified()?.into(),
        checksum: digest,
    };

    let source = if state.file_size > maximum_staging_size {
        FileReference::Snapshot { reference, file }
    } else {
        file.seek(SeekFrom::Start(0))?;
        let staged = staging.stage_file(&mut file)?;
        drop(file);
        reference.release();
        FileReference::Staged(staged)
    };

    Ok(Some(UploadItem { path, state, source }))
}
