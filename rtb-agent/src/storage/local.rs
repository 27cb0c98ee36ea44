//! Remote storage backed by a local (or mounted) directory.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use super::{RemoteStorage, UploadReader};
use crate::transfer::{ProgressCallback, ProgressStream};
use crate::utils::errors::{AgentError, Result};

const PARTIAL_SUFFIX: &str = ".partial";

pub struct LocalDirectoryStorage {
    root: PathBuf,
}

impl LocalDirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: std::fs::canonicalize(&root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a `/`-separated remote path under the root, refusing traversal.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            return Err(AgentError::Storage("empty storage path".to_string()));
        }
        if Path::new(relative)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(AgentError::Storage(format!("unsafe storage path: {}", path)));
        }
        Ok(self.root.join(relative))
    }

    fn partial_path_for(target: &Path) -> PathBuf {
        let name = format!(".{}{}", Uuid::new_v4(), PARTIAL_SUFFIX);
        match target.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }

    async fn ensure_parent(target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn write_stream(
        partial: &Path,
        reader: UploadReader,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut file = fs::File::create(partial).await?;
        let mut stream = ProgressStream::new(ReaderStream::new(reader), progress);

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            };
            match chunk {
                Some(bytes) => file.write_all(&bytes?).await?,
                None => break,
            }
        }

        file.sync_all().await?;
        Ok(stream.bytes_transferred())
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(AgentError::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl RemoteStorage for LocalDirectoryStorage {
    async fn upload_file(
        &self,
        path: &str,
        reader: UploadReader,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        check_cancelled(cancel)?;
        let target = self.resolve(path)?;
        Self::ensure_parent(&target).await?;

        // Readers never observe a partial object under the final name
        let partial = Self::partial_path_for(&target);
        match Self::write_stream(&partial, reader, progress, cancel).await {
            Ok(bytes) => {
                fs::rename(&partial, &target).await?;
                debug!(path, bytes, "Stored object");
                Ok(Uuid::new_v4().to_string())
            }
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn move_file(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        Self::ensure_parent(&target).await?;

        match fs::rename(&source, &target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AgentError::Storage(format!(
                "cannot move {} to {}: source does not exist",
                from, to
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        self.delete_file_direct(path, cancel).await
    }

    async fn upload_file_direct(
        &self,
        path: &str,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_cancelled(cancel)?;
        let target = self.resolve(path)?;
        Self::ensure_parent(&target).await?;

        let partial = Self::partial_path_for(&target);
        if let Err(e) = fs::write(&partial, &data).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        fs::rename(&partial, &target).await?;
        Ok(())
    }

    async fn download_file_direct(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        check_cancelled(cancel)?;
        match fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file_direct(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        match fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn enumerate_files(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        check_cancelled(cancel)?;
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for entry in WalkDir::new(&root).into_iter().flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                if let Ok(relative) = entry.path().strip_prefix(&root) {
                    let remote = format!("/{}", relative.to_string_lossy());
                    if remote.starts_with(&prefix) {
                        files.push(remote);
                    }
                }
            }
            files.sort();
            files
        })
        .await?;

        Ok(files)
    }
}
