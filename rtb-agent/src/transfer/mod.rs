//! Upload progress reporting.

pub mod progress;
pub mod progress_stream;

pub use progress::{format_bytes, UploadProgress};
pub use progress_stream::{ProgressCallback, ProgressStream};
