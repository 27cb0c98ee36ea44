//! RemoteFileStateCache: what has already been replicated, path by path.
//!
//! The map is rebuilt on load by replaying every local batch in ascending
//! order. Updates append to the current batch, which rolls over once it
//! reaches the configured size. A background task uploads batches and
//! consolidates the oldest ones so replay cost stays bounded.

use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::batch_storage::{BatchStorage, BatchWriter};
use super::file_state::{BatchRecord, FileState};
use crate::config::StateCacheConfig;
use crate::storage::{batch_path, RemoteStorage};
use crate::utils::errors::Result;
use crate::utils::sync::lock;

struct CacheInner {
    states: HashMap<String, FileState>,
    /// Rolled-over batches still present locally, oldest first.
    closed_batches: BTreeSet<u64>,
    /// Closed batches whose final contents are known to be uploaded.
    uploaded_batches: BTreeSet<u64>,
    current_batch: u64,
    current_writer: Option<Box<dyn BatchWriter>>,
    current_size: u64,
    /// Lines appended to the current batch.
    current_generation: u64,
    /// `current_generation` as of the last upload of the current batch.
    uploaded_generation: u64,
}

impl CacheInner {
    fn current_is_dirty(&self) -> bool {
        self.current_generation != self.uploaded_generation
    }
}

pub struct RemoteFileStateCache {
    inner: Mutex<CacheInner>,
    batch_storage: Arc<dyn BatchStorage>,
    remote: Arc<dyn RemoteStorage>,
    config: StateCacheConfig,
    /// Held for the duration of every upload or consolidation.
    busy: tokio::sync::Mutex<()>,
    stopping: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteFileStateCache {
    /// Replay every local batch into a fresh map.
    pub fn load(
        batch_storage: Arc<dyn BatchStorage>,
        remote: Arc<dyn RemoteStorage>,
        config: StateCacheConfig,
    ) -> Result<Self> {
        let batches = batch_storage.enumerate_batches()?;
        let mut states = HashMap::new();

        for &batch_number in &batches {
            let contents = batch_storage.read_batch(batch_number)?;
            replay_batch(batch_number, &contents, &mut states);
        }

        let closed_batches: BTreeSet<u64> = batches.iter().copied().collect();
        let uploaded_batches: BTreeSet<u64> = batch_storage
            .uploaded_batches()?
            .intersection(&closed_batches)
            .copied()
            .collect();
        let current_batch = batches.last().map_or(1, |last| last + 1);
        info!(
            batches = batches.len(),
            uploaded = uploaded_batches.len(),
            paths = states.len(),
            current_batch,
            "Loaded remote file state cache"
        );

        Ok(Self {
            inner: Mutex::new(CacheInner {
                states,
                closed_batches,
                uploaded_batches,
                current_batch,
                current_writer: None,
                current_size: 0,
                current_generation: 0,
                uploaded_generation: 0,
            }),
            batch_storage,
            remote,
            config,
            busy: tokio::sync::Mutex::new(()),
            stopping: CancellationToken::new(),
            maintenance: Mutex::new(None),
        })
    }

    pub fn get_file_state(&self, path: &str) -> Option<FileState> {
        lock(&self.inner).states.get(path).cloned()
    }

    pub fn contains_path(&self, path: &str) -> bool {
        lock(&self.inner).states.contains_key(path)
    }

    pub fn enumerate_paths(&self) -> Vec<String> {
        lock(&self.inner).states.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_batch_number(&self) -> u64 {
        lock(&self.inner).current_batch
    }

    /// Record `state` for `path` and append it to the current batch.
    pub fn update_file_state(&self, path: &str, mut state: FileState) -> Result<()> {
        state.path = path.to_string();
        let line = state.to_line()?;

        let mut inner = lock(&self.inner);
        self.append_line(&mut inner, &line)?;
        inner.states.insert(state.path.clone(), state);
        Ok(())
    }

    /// Forget `path`. Returns whether the cache held an entry for it.
    pub fn remove_file_state(&self, path: &str) -> Result<bool> {
        let mut inner = lock(&self.inner);
        if !inner.states.contains_key(path) {
            return Ok(false);
        }

        let line = BatchRecord::Removed(path.to_string()).to_line()?;
        self.append_line(&mut inner, &line)?;
        inner.states.remove(path);
        Ok(true)
    }

    /// Replace `from` with `to`, carrying the state over.
    ///
    /// Both lines land in the current batch under one lock.
    pub fn move_file_state(&self, from: &str, to: &str, mut state: FileState) -> Result<()> {
        state.path = to.to_string();
        let removal = BatchRecord::Removed(from.to_string()).to_line()?;
        let insert = state.to_line()?;

        let mut inner = lock(&self.inner);
        self.append_line(&mut inner, &format!("{}\n{}", removal, insert))?;
        inner.states.remove(from);
        inner.states.insert(state.path.clone(), state);
        Ok(())
    }

    fn append_line(&self, inner: &mut CacheInner, line: &str) -> Result<()> {
        if inner.current_writer.is_none() {
            inner.current_writer = Some(self.batch_storage.open_batch_writer(inner.current_batch)?);
        }

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        if let Some(writer) = inner.current_writer.as_mut() {
            writer.append(&bytes)?;
            writer.flush()?;
        }

        inner.current_size += bytes.len() as u64;
        inner.current_generation += 1;

        if inner.current_size >= self.config.maximum_batch_size {
            let closed = inner.current_batch;
            inner.closed_batches.insert(closed);
            inner.current_batch += 1;
            inner.current_writer = None;
            inner.current_size = 0;
            inner.current_generation = 0;
            inner.uploaded_generation = 0;
            debug!(closed, current = inner.current_batch, "Rolled over state batch");
        }

        Ok(())
    }

    /// Upload the full contents of the current batch to `/state/<n>`.
    pub async fn upload_current_batch(&self, cancel: &CancellationToken) -> Result<()> {
        let _busy = self.busy.lock().await;
        self.upload_current_batch_locked(cancel).await
    }

    async fn upload_current_batch_locked(&self, cancel: &CancellationToken) -> Result<()> {
        let (batch_number, generation, contents) = {
            let mut inner = lock(&self.inner);
            if inner.current_generation == 0 {
                return Ok(());
            }
            if let Some(writer) = inner.current_writer.as_mut() {
                writer.flush()?;
            }
            let contents = self.batch_storage.read_batch(inner.current_batch)?;
            (inner.current_batch, inner.current_generation, contents)
        };

        self.remote
            .upload_file_direct(&batch_path(batch_number), Bytes::from(contents), cancel)
            .await?;

        let mut inner = lock(&self.inner);
        if inner.current_batch == batch_number {
            inner.uploaded_generation = generation;
        }
        debug!(batch_number, "Uploaded current state batch");
        Ok(())
    }

    async fn upload_closed_batches_locked(&self, cancel: &CancellationToken) -> Result<()> {
        let pending: Vec<u64> = {
            let inner = lock(&self.inner);
            inner
                .closed_batches
                .difference(&inner.uploaded_batches)
                .copied()
                .collect()
        };

        for batch_number in pending {
            let contents = self.batch_storage.read_batch(batch_number)?;
            self.remote
                .upload_file_direct(&batch_path(batch_number), Bytes::from(contents), cancel)
                .await?;
            lock(&self.inner).uploaded_batches.insert(batch_number);
            self.record_uploaded()?;
            debug!(batch_number, "Uploaded closed state batch");
        }

        Ok(())
    }

    fn record_uploaded(&self) -> Result<()> {
        let uploaded = lock(&self.inner).uploaded_batches.clone();
        self.batch_storage.record_uploaded_batches(&uploaded)
    }

    /// Merge the oldest closed batch into the next oldest and retire it.
    ///
    /// Returns the retired batch number, or `None` when fewer than two
    /// closed batches exist.
    pub async fn consolidate_oldest_batch(&self, cancel: &CancellationToken) -> Result<Option<u64>> {
        let _busy = self.busy.lock().await;
        self.consolidate_oldest_batch_locked(cancel).await
    }

    async fn consolidate_oldest_batch_locked(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>> {
        let (oldest, next) = {
            let inner = lock(&self.inner);
            let mut closed = inner.closed_batches.iter().copied();
            match (closed.next(), closed.next()) {
                (Some(oldest), Some(next)) => (oldest, next),
                _ => return Ok(None),
            }
        };

        let oldest_contents = self.batch_storage.read_batch(oldest)?;
        let next_contents = self.batch_storage.read_batch(next)?;
        let merged = merge_batches(oldest, &oldest_contents, next, &next_contents)?;

        self.remote
            .upload_file_direct(&batch_path(next), Bytes::from(merged.clone()), cancel)
            .await?;
        self.remote
            .delete_file_direct(&batch_path(oldest), cancel)
            .await?;
        self.batch_storage
            .switch_to_consolidated(oldest, next, &merged)?;

        {
            let mut inner = lock(&self.inner);
            inner.closed_batches.remove(&oldest);
            inner.uploaded_batches.remove(&oldest);
            inner.uploaded_batches.insert(next);
        }
        self.record_uploaded()?;
        info!(retired = oldest, merged_into = next, "Consolidated state batches");
        Ok(Some(oldest))
    }

    /// One maintenance pass: upload what has not been uploaded, then
    /// consolidate down to the configured number of live batches.
    async fn run_maintenance(&self, cancel: &CancellationToken) -> Result<()> {
        let _busy = self.busy.lock().await;

        self.upload_closed_batches_locked(cancel).await?;
        let dirty = lock(&self.inner).current_is_dirty();
        if dirty {
            self.upload_current_batch_locked(cancel).await?;
        }

        loop {
            let live = lock(&self.inner).closed_batches.len();
            if live <= self.config.maximum_live_batches {
                break;
            }
            if self.consolidate_oldest_batch_locked(cancel).await?.is_none() {
                break;
            }
        }

        Ok(())
    }

    /// Start periodic uploads and consolidation. A final upload runs once stopped.
    pub fn start_maintenance(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            // In-flight transfers are allowed to finish after stop
            let transfers = CancellationToken::new();
            let interval = cache.config.batch_upload_interval();

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cache.stopping.cancelled() => break,
                }

                if let Err(e) = cache.run_maintenance(&transfers).await {
                    warn!(error = %e, "State cache maintenance failed");
                }
            }

            if let Err(e) = cache.run_maintenance(&transfers).await {
                error!(error = %e, "Final state cache upload failed");
            }
        });

        *lock(&self.maintenance) = Some(handle);
    }

    /// Halt background maintenance.
    pub fn stop(&self) {
        self.stopping.cancel();
    }

    /// Block until no upload or consolidation is in flight.
    pub async fn wait_while_busy(&self) {
        if self.stopping.is_cancelled() {
            let handle = lock(&self.maintenance).take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    error!(error = %e, "State cache maintenance task failed");
                }
            }
        }
        let _busy = self.busy.lock().await;
    }
}

fn replay_batch(batch_number: u64, contents: &[u8], states: &mut HashMap<String, FileState>) {
    for record in parse_batch(batch_number, contents) {
        match record {
            BatchRecord::State(state) => {
                states.insert(state.path.clone(), state);
            }
            BatchRecord::Removed(path) => {
                states.remove(&path);
            }
        }
    }
}

/// Malformed lines are skipped; a crash can leave a torn final line.
fn parse_batch(batch_number: u64, contents: &[u8]) -> Vec<BatchRecord> {
    String::from_utf8_lossy(contents)
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| match BatchRecord::parse(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(batch_number, error = %e, "Skipping malformed state line");
                None
            }
        })
        .collect()
}

/// Last record per path, positioned where the path first appeared.
fn compact(records: Vec<BatchRecord>) -> (Vec<String>, HashMap<String, BatchRecord>) {
    let mut order = Vec::new();
    let mut latest = HashMap::new();
    for record in records {
        let path = record.path().to_string();
        if latest.insert(path.clone(), record).is_none() {
            order.push(path);
        }
    }
    (order, latest)
}

/// The oldest batch's order, newer values replacing in place, newer paths
/// appended in their own order. The result becomes the oldest batch, so
/// removal records are dropped.
fn merge_batches(
    oldest: u64,
    oldest_contents: &[u8],
    next: u64,
    next_contents: &[u8],
) -> Result<Vec<u8>> {
    let (mut order, mut merged) = compact(parse_batch(oldest, oldest_contents));
    let (next_order, mut next_latest) = compact(parse_batch(next, next_contents));

    for path in next_order {
        if let Some(record) = next_latest.remove(&path) {
            if merged.insert(path.clone(), record).is_none() {
                order.push(path);
            }
        }
    }

    let mut out = Vec::new();
    for path in order {
        if let Some(BatchRecord::State(state)) = merged.remove(&path) {
            out.extend_from_slice(state.to_line()?.as_bytes());
            out.push(b'\n');
        }
    }
    Ok(out)
}
