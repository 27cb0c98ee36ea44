//! Per-file upload progress, shared between the transfer and whoever reports on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::progress_stream::ProgressCallback;

/// Point-in-time view of one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub bytes_per_second: u64,
    /// 0-100
    pub percent_complete: f64,
}

impl TransferProgress {
    pub fn is_complete(&self) -> bool {
        self.transferred_bytes >= self.total_bytes
    }
}

/// Tracks bytes sent for a single file.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    total_bytes: u64,
    transferred: Arc<AtomicU64>,
    started: Instant,
}

impl UploadProgress {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            transferred: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
        }
    }

    /// Callback for a `ProgressStream`, updating this tracker.
    pub fn callback(&self) -> ProgressCallback {
        let transferred = Arc::clone(&self.transferred);
        Arc::new(move |bytes: u64| {
            transferred.store(bytes, Ordering::Relaxed);
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> TransferProgress {
        let transferred_bytes = self.transferred.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();

        let bytes_per_second = if elapsed > 0.0 {
            (transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        };
        let percent_complete = if self.total_bytes > 0 {
            (transferred_bytes as f64 / self.total_bytes as f64) * 100.0
        } else {
            100.0
        };

        TransferProgress {
            total_bytes: self.total_bytes,
            transferred_bytes,
            bytes_per_second,
            percent_complete,
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
