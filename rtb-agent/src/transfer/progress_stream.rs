//! Stream wrapper that reports how many bytes have passed through it.

use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Receives the running total of bytes transferred.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

pub struct ProgressStream<S> {
    inner: S,
    bytes_transferred: u64,
    last_update: Option<Instant>,
    update_interval: Duration,
    callback: Option<ProgressCallback>,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    /// Without a callback the stream only counts.
    pub fn new(inner: S, callback: Option<ProgressCallback>) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
            last_update: None,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            callback,
        }
    }

    pub fn with_update_interval(mut self, update_interval: Duration) -> Self {
        self.update_interval = update_interval;
        self
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    fn report(&mut self, force: bool) {
        let Some(callback) = &self.callback else {
            return;
        };

        let now = Instant::now();
        let due = self
            .last_update
            .map_or(true, |last| now.duration_since(last) >= self.update_interval);
        if force || due {
            callback(self.bytes_transferred);
            self.last_update = Some(now);
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_transferred += bytes.len() as u64;
                self.report(false);
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(None) => {
                // Final total, regardless of the interval
                self.report(true);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
