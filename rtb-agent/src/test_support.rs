//! Hand-written fakes of the agent's collaborators.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::fs::open_handles::{FileAccess, OpenFileHandle, OpenFileHandles};
use crate::snapshot::{SnapshotHandle, SnapshotProvider};
use crate::state::batch_storage::{BatchStorage, BatchWriter};
use crate::storage::{RemoteStorage, UploadReader};
use crate::transfer::ProgressCallback;
use crate::utils::errors::{AgentError, Result};
use crate::utils::sync::lock;

type Batches = Arc<Mutex<BTreeMap<u64, Vec<u8>>>>;

#[derive(Default)]
pub struct MemoryBatchStorage {
    batches: Batches,
    uploaded: Mutex<BTreeSet<u64>>,
}

impl MemoryBatchStorage {
    pub fn insert(&self, batch_number: u64, contents: Vec<u8>) {
        lock(&self.batches).insert(batch_number, contents);
    }

    pub fn contents(&self, batch_number: u64) -> Option<Vec<u8>> {
        lock(&self.batches).get(&batch_number).cloned()
    }

    pub fn line_count(&self, batch_number: u64) -> usize {
        self.contents(batch_number)
            .map(|c| c.iter().filter(|&&b| b == b'\n').count())
            .unwrap_or(0)
    }

    pub fn numbers(&self) -> Vec<u64> {
        lock(&self.batches).keys().copied().collect()
    }
}

struct MemoryBatchWriter {
    batches: Batches,
    batch_number: u64,
}

impl BatchWriter for MemoryBatchWriter {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        lock(&self.batches)
            .entry(self.batch_number)
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BatchStorage for MemoryBatchStorage {
    fn enumerate_batches(&self) -> Result<Vec<u64>> {
        Ok(self.numbers())
    }

    fn read_batch(&self, batch_number: u64) -> Result<Vec<u8>> {
        self.contents(batch_number).ok_or_else(|| {
            AgentError::Io(io::Error::new(io::ErrorKind::NotFound, "no such batch"))
        })
    }

    fn open_batch_writer(&self, batch_number: u64) -> Result<Box<dyn BatchWriter>> {
        lock(&self.batches).entry(batch_number).or_default();
        Ok(Box::new(MemoryBatchWriter {
            batches: Arc::clone(&self.batches),
            batch_number,
        }))
    }

    fn switch_to_consolidated(&self, retired: u64, merged_into: u64, merged: &[u8]) -> Result<()> {
        let mut batches = lock(&self.batches);
        batches.insert(merged_into, merged.to_vec());
        batches.remove(&retired);
        Ok(())
    }

    fn uploaded_batches(&self) -> Result<BTreeSet<u64>> {
        Ok(lock(&self.uploaded).clone())
    }

    fn record_uploaded_batches(&self, uploaded: &BTreeSet<u64>) -> Result<()> {
        *lock(&self.uploaded) = uploaded.clone();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    Upload(String),
    Move(String, String),
    Delete(String),
    UploadDirect(String),
    DeleteDirect(String),
}

/// Keeps objects in memory and records every mutating call.
#[derive(Default)]
pub struct RecordingRemoteStorage {
    objects: Mutex<BTreeMap<String, Bytes>>,
    calls: Mutex<Vec<StorageCall>>,
    /// Uploads block until cancelled.
    hold_uploads: AtomicBool,
    uploads_started: AtomicUsize,
}

impl RecordingRemoteStorage {
    pub fn holding_uploads() -> Self {
        let storage = Self::default();
        storage.hold_uploads.store(true, Ordering::SeqCst);
        storage
    }

    pub fn calls(&self) -> Vec<StorageCall> {
        lock(&self.calls).clone()
    }

    pub fn object(&self, path: &str) -> Option<Bytes> {
        lock(&self.objects).get(path).cloned()
    }

    pub fn put(&self, path: &str, data: &'static [u8]) {
        lock(&self.objects).insert(path.to_string(), Bytes::from_static(data));
    }

    pub fn uploads_started(&self) -> usize {
        self.uploads_started.load(Ordering::SeqCst)
    }

    fn record(&self, call: StorageCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl RemoteStorage for RecordingRemoteStorage {
    async fn upload_file(
        &self,
        path: &str,
        mut reader: UploadReader,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.uploads_started.fetch_add(1, Ordering::SeqCst);
        if self.hold_uploads.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(AgentError::Cancelled);
        }

        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        if let Some(progress) = progress {
            progress(data.len() as u64);
        }

        lock(&self.objects).insert(path.to_string(), Bytes::from(data));
        self.record(StorageCall::Upload(path.to_string()));
        Ok(format!("key-{}", path))
    }

    async fn move_file(&self, from: &str, to: &str, _cancel: &CancellationToken) -> Result<()> {
        let mut objects = lock(&self.objects);
        if let Some(data) = objects.remove(from) {
            objects.insert(to.to_string(), data);
        }
        drop(objects);
        self.record(StorageCall::Move(from.to_string(), to.to_string()));
        Ok(())
    }

    async fn delete_file(&self, path: &str, _cancel: &CancellationToken) -> Result<()> {
        lock(&self.objects).remove(path);
        self.record(StorageCall::Delete(path.to_string()));
        Ok(())
    }

    async fn upload_file_direct(
        &self,
        path: &str,
        data: Bytes,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        lock(&self.objects).insert(path.to_string(), data);
        self.record(StorageCall::UploadDirect(path.to_string()));
        Ok(())
    }

    async fn download_file_direct(
        &self,
        path: &str,
        _cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        Ok(self.object(path))
    }

    async fn delete_file_direct(&self, path: &str, _cancel: &CancellationToken) -> Result<()> {
        lock(&self.objects).remove(path);
        self.record(StorageCall::DeleteDirect(path.to_string()));
        Ok(())
    }

    async fn enumerate_files(
        &self,
        prefix: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        Ok(lock(&self.objects)
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Open handles set up by the test.
#[derive(Default)]
pub struct ScriptedOpenFileHandles {
    writers: Mutex<HashMap<PathBuf, usize>>,
}

impl ScriptedOpenFileHandles {
    pub fn open_for_write(&self, path: impl Into<PathBuf>) {
        *lock(&self.writers).entry(path.into()).or_default() += 1;
    }

    pub fn close(&self, path: impl AsRef<Path>) {
        lock(&self.writers).remove(path.as_ref());
    }
}

impl OpenFileHandles for ScriptedOpenFileHandles {
    fn enumerate(&self, path: &Path) -> io::Result<Vec<OpenFileHandle>> {
        let count = lock(&self.writers).get(path).copied().unwrap_or(0);
        Ok((0..count)
            .map(|fd| OpenFileHandle {
                process_id: 4242,
                file_descriptor: fd as u32 + 3,
                access: FileAccess::Write,
            })
            .collect())
    }
}

/// Counts snapshot lifetimes. Either passes paths through or copies a
/// source tree so each snapshot really is frozen in time.
pub struct CountingSnapshotProvider {
    created: Arc<AtomicUsize>,
    destroyed: Arc<AtomicUsize>,
    fail: AtomicBool,
    copy: Option<(PathBuf, PathBuf)>,
}

impl CountingSnapshotProvider {
    pub fn pass_through() -> Self {
        Self {
            created: Arc::new(AtomicUsize::new(0)),
            destroyed: Arc::new(AtomicUsize::new(0)),
            fail: AtomicBool::new(false),
            copy: None,
        }
    }

    pub fn copying(source: impl Into<PathBuf>, snapshots: impl Into<PathBuf>) -> Self {
        Self {
            copy: Some((source.into(), snapshots.into())),
            ..Self::pass_through()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.created() - self.destroyed()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

struct CountingSnapshot {
    name: String,
    destroyed: Arc<AtomicUsize>,
    copy: Option<(PathBuf, PathBuf)>,
}

impl SnapshotHandle for CountingSnapshot {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_path(&self, path: &Path) -> PathBuf {
        match &self.copy {
            Some((source, frozen)) => match path.strip_prefix(source) {
                Ok(relative) => frozen.join(relative),
                Err(_) => path.to_path_buf(),
            },
            None => path.to_path_buf(),
        }
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        if let Some((_, frozen)) = &self.copy {
            std::fs::remove_dir_all(frozen)?;
        }
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl SnapshotProvider for CountingSnapshotProvider {
    fn create_snapshot(&self, name: &str) -> Result<Box<dyn SnapshotHandle>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::Snapshot("snapshot creation disabled".to_string()));
        }

        let index = self.created.fetch_add(1, Ordering::SeqCst);
        let copy = match &self.copy {
            Some((source, snapshots)) => {
                let frozen = snapshots.join(format!("{}-{}", name, index));
                copy_tree(source, &frozen)?;
                Some((source.clone(), frozen))
            }
            None => None,
        };

        Ok(Box::new(CountingSnapshot {
            name: name.to_string(),
            destroyed: Arc::clone(&self.destroyed),
            copy,
        }))
    }
}

fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in WalkDir::new(source).into_iter().flatten() {
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}
