//! Remote object storage contract.
//!
//! File content lives under [`CONTENT_PREFIX`], cache batches under
//! [`STATE_PREFIX`]. Every operation takes a cancellation token; an
//! implementation must abandon in-flight transfers once it fires.

pub mod local;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::transfer::ProgressCallback;
use crate::utils::errors::Result;

pub use local::LocalDirectoryStorage;

pub const CONTENT_PREFIX: &str = "/content";
pub const STATE_PREFIX: &str = "/state";

pub type UploadReader = Box<dyn AsyncRead + Send + Unpin>;

/// Remote path for the content of a local file.
pub fn content_path(local_path: &str) -> String {
    if local_path.starts_with('/') {
        format!("{}{}", CONTENT_PREFIX, local_path)
    } else {
        format!("{}/{}", CONTENT_PREFIX, local_path)
    }
}

/// Remote path of a cache batch.
pub fn batch_path(batch_number: u64) -> String {
    format!("{}/{}", STATE_PREFIX, batch_number)
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Stream a file to `path`. Returns the content key of the stored object.
    async fn upload_file(
        &self,
        path: &str,
        reader: UploadReader,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<String>;

    async fn move_file(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<()>;

    async fn delete_file(&self, path: &str, cancel: &CancellationToken) -> Result<()>;

    /// Small objects addressed by path only, used for cache batches.
    async fn upload_file_direct(
        &self,
        path: &str,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// `None` if nothing is stored at `path`.
    async fn download_file_direct(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>>;

    async fn delete_file_direct(&self, path: &str, cancel: &CancellationToken) -> Result<()>;

    /// Every stored path beginning with `prefix`.
    async fn enumerate_files(&self, prefix: &str, cancel: &CancellationToken)
        -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_paths() {
        assert_eq!(content_path("/home/a b.txt"), "/content/home/a b.txt");
        assert_eq!(content_path("rel/x"), "/content/rel/x");
        assert_eq!(batch_path(42), "/state/42");
    }
}
