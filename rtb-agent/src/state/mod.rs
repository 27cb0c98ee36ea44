//! Record of what has been replicated: the FileState line codec, local batch
//! files and the RemoteFileStateCache built on them.

pub mod batch_storage;
pub mod cache;
pub mod file_state;

pub use batch_storage::{BatchStorage, LocalBatchStorage};
pub use cache::RemoteFileStateCache;
pub use file_state::{BatchRecord, FileState};
