//! Most-recently-added-first work queue.
//!
//! Recent activity is served before stale work. Under sustained load the
//! oldest entries can wait indefinitely.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::utils::sync::lock;

pub struct LifoQueue<T> {
    items: Mutex<Vec<T>>,
    available: Notify,
}

impl<T> Default for LifoQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            available: Notify::new(),
        }
    }
}

impl<T> LifoQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        lock(&self.items).push(item);
        self.available.notify_one();
    }

    pub fn push_all(&self, items: impl IntoIterator<Item = T>) {
        let mut count = 0;
        {
            let mut queue = lock(&self.items);
            for item in items {
                queue.push(item);
                count += 1;
            }
        }
        for _ in 0..count {
            self.available.notify_one();
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        lock(&self.items).pop()
    }

    /// Pop the newest item, counting it in `in_flight` before the lock is released.
    pub fn try_pop_entered<'a>(&self, in_flight: &'a InFlight) -> Option<(T, InFlightGuard<'a>)> {
        let mut items = lock(&self.items);
        let item = items.pop()?;
        Some((item, in_flight.enter()))
    }

    /// Wait for the newest item. `None` once `cancel` fires, even if items remain.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<T> {
        let in_flight = InFlight::default();
        self.pop_entered(cancel, &in_flight).await.map(|(item, _)| item)
    }

    pub async fn pop_entered<'a>(
        &self,
        cancel: &CancellationToken,
        in_flight: &'a InFlight,
    ) -> Option<(T, InFlightGuard<'a>)> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(entered) = self.try_pop_entered(in_flight) {
                return Some(entered);
            }
            tokio::select! {
                _ = self.available.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    /// Drop everything queued. Returns how many items there were.
    pub fn clear(&self) -> usize {
        std::mem::take(&mut *lock(&self.items)).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counts items a stage has taken off its list but not yet handed on.
#[derive(Default)]
pub struct InFlight {
    count: AtomicUsize,
}

impl InFlight {
    pub fn enter(&self) -> InFlightGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { in_flight: self }
    }

    pub fn is_zero(&self) -> bool {
        self.count.load(Ordering::SeqCst) == 0
    }
}

pub struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.count.fetch_sub(1, Ordering::SeqCst);
    }
}
