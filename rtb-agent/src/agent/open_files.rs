//! Open-file polling: hold snapshotted paths until nobody has them open for writing.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::action::BackupAction;
use super::long_polling::LongPollingStage;
use super::queue::{InFlight, LifoQueue};
use crate::fs::open_handles::{is_open_for_write, OpenFileHandles};
use crate::snapshot::SnapshotReference;
use crate::utils::sync::lock;

struct OpenFileEntry {
    reference: SnapshotReference,
    /// Past this, the entry moves to long polling.
    timeout: Instant,
}

pub struct OpenFilesStage {
    entries: Mutex<Vec<OpenFileEntry>>,
    arrived: Notify,
    polling_interval: Duration,
    maximum_wait: Duration,
    open_handles: Arc<dyn OpenFileHandles>,
    in_flight: InFlight,
}

/// What one poll decided.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub promoted: usize,
    pub timed_out: usize,
    pub still_open: usize,
}

impl OpenFilesStage {
    pub fn new(
        polling_interval: Duration,
        maximum_wait: Duration,
        open_handles: Arc<dyn OpenFileHandles>,
    ) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            arrived: Notify::new(),
            polling_interval,
            maximum_wait,
            open_handles,
            in_flight: InFlight::default(),
        }
    }

    pub fn add(&self, reference: SnapshotReference) {
        self.add_all(std::iter::once(reference));
    }

    pub fn add_all(&self, references: impl IntoIterator<Item = SnapshotReference>) {
        let timeout = Instant::now() + self.maximum_wait;
        lock(&self.entries).extend(
            references
                .into_iter()
                .map(|reference| OpenFileEntry { reference, timeout }),
        );
        self.arrived.notify_one();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, releasing its snapshot reference.
    pub fn clear(&self) -> usize {
        std::mem::take(&mut *lock(&self.entries)).len()
    }

    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.in_flight.is_zero()
    }

    pub async fn run(
        &self,
        long_polling: &LongPollingStage,
        backup_queue: &LifoQueue<BackupAction>,
        stopping: &CancellationToken,
    ) {
        loop {
            if self.is_empty() {
                tokio::select! {
                    _ = self.arrived.notified() => {}
                    _ = stopping.cancelled() => break,
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.polling_interval) => {}
                    _ = stopping.cancelled() => break,
                }
            }

            self.poll(long_polling, backup_queue).await;
        }
        debug!("Open file polling stopped");
    }

    /// Promote closed files, hand timed-out ones to long polling, keep the rest.
    pub async fn poll(
        &self,
        long_polling: &LongPollingStage,
        backup_queue: &LifoQueue<BackupAction>,
    ) -> PollOutcome {
        let _working = self.in_flight.enter();
        let entries = std::mem::take(&mut *lock(&self.entries));
        if entries.is_empty() {
            return PollOutcome::default();
        }

        let open_handles = Arc::clone(&self.open_handles);
        let checked = tokio::task::spawn_blocking(move || {
            entries
                .into_iter()
                .map(|entry| {
                    let open = is_open_for_write(&*open_handles, Path::new(entry.reference.path()));
                    (entry, open)
                })
                .collect::<Vec<_>>()
        })
        .await;

        let checked = match checked {
            Ok(checked) => checked,
            Err(e) => {
                error!(error = %e, "Open handle check failed");
                return PollOutcome::default();
            }
        };

        let now = Instant::now();
        let mut outcome = PollOutcome::default();
        let mut promoted = Vec::new();
        let mut still_open = Vec::new();

        for (entry, open) in checked {
            if !open {
                promoted.push(BackupAction::Upload(entry.reference));
                outcome.promoted += 1;
            } else if entry.timeout <= now {
                debug!(path = %entry.reference.path(), "Still open for writing, moving to long polling");
                long_polling.add(entry.reference);
                outcome.timed_out += 1;
            } else {
                still_open.push(entry);
                outcome.still_open += 1;
            }
        }

        backup_queue.push_all(promoted);

        // Entries that arrived during the check go after the older ones
        let mut entries = lock(&self.entries);
        let arrived = std::mem::replace(&mut *entries, still_open);
        entries.extend(arrived);

        outcome
    }
}
