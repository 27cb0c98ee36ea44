//! Upload worker pool.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::action::UploadItem;
use super::queue::{InFlight, LifoQueue};
use crate::state::RemoteFileStateCache;
use crate::storage::{content_path, RemoteStorage};
use crate::transfer::{format_bytes, UploadProgress};
use crate::utils::errors::{AgentError, Result};

pub struct UploadPool {
    queue: LifoQueue<UploadItem>,
    in_flight: InFlight,
    worker_count: usize,
    storage: Arc<dyn RemoteStorage>,
    cache: Arc<RemoteFileStateCache>,
}

impl UploadPool {
    pub fn new(
        worker_count: usize,
        storage: Arc<dyn RemoteStorage>,
        cache: Arc<RemoteFileStateCache>,
    ) -> Self {
        Self {
            queue: LifoQueue::new(),
            in_flight: InFlight::default(),
            worker_count: worker_count.max(1),
            storage,
            cache,
        }
    }

    pub fn push(&self, item: UploadItem) {
        self.queue.push(item);
    }

    pub fn queue(&self) -> &LifoQueue<UploadItem> {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.in_flight.is_zero()
    }

    /// Spawn the workers. Cancelling `cancel` interrupts in-flight uploads.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.worker_count)
            .map(|worker| {
                let pool = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.run_worker(worker, &cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, cancel: &CancellationToken) {
        while let Some((item, _working)) = self.queue.pop_entered(cancel, &self.in_flight).await {
            let path = item.path.clone();
            match self.upload(item, cancel).await {
                Ok(()) => {}
                Err(AgentError::Cancelled) => debug!(worker, path = %path, "Upload cancelled"),
                Err(e) => warn!(worker, path = %path, error = %e, "Upload failed"),
            }
        }
        debug!(worker, "Upload worker stopped");
    }

    /// Upload one file and record what was replicated.
    pub async fn upload(&self, mut item: UploadItem, cancel: &CancellationToken) -> Result<()> {
        let reader = item.source.open_reader()?;
        let progress = UploadProgress::new(item.state.file_size);
        let remote_path = content_path(&item.path);

        let content_key = tokio::select! {
            result = self.storage.upload_file(&remote_path, reader, Some(progress.callback()), cancel) => result?,
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        item.state.content_key = content_key;
        self.cache.update_file_state(&item.path, item.state.clone())?;

        let transferred = progress.snapshot();
        info!(
            path = %item.path,
            size = %format_bytes(transferred.transferred_bytes),
            elapsed_ms = progress.elapsed().as_millis() as u64,
            "Uploaded"
        );
        Ok(())
    }
}
