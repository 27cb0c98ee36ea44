//! Intake batching: paths arriving within one window share a snapshot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::open_files::OpenFilesStage;
use super::queue::InFlight;
use crate::snapshot::{take_shared_snapshot, SnapshotProvider, SnapshotReference};
use crate::utils::sync::lock;

#[derive(Default)]
struct PendingBatch {
    paths: Vec<String>,
    seen: HashSet<String>,
}

pub struct IntakeStage {
    pending: Mutex<PendingBatch>,
    /// Fired by the first path into an empty batch.
    armed: Notify,
    /// Ends the current window early.
    force: Notify,
    window: Duration,
    snapshots: Arc<dyn SnapshotProvider>,
    in_flight: InFlight,
}

impl IntakeStage {
    pub fn new(window: Duration, snapshots: Arc<dyn SnapshotProvider>) -> Self {
        Self {
            pending: Mutex::new(PendingBatch::default()),
            armed: Notify::new(),
            force: Notify::new(),
            window,
            snapshots,
            in_flight: InFlight::default(),
        }
    }

    pub fn add(&self, path: impl Into<String>) {
        self.add_all(std::iter::once(path.into()));
    }

    pub fn add_all(&self, paths: impl IntoIterator<Item = String>) {
        let was_empty = {
            let mut pending = lock(&self.pending);
            let was_empty = pending.paths.is_empty();
            for path in paths {
                if pending.seen.insert(path.clone()) {
                    pending.paths.push(path);
                }
            }
            was_empty && !pending.paths.is_empty()
        };

        if was_empty {
            self.armed.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        std::mem::take(&mut *lock(&self.pending)).paths.len()
    }

    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.in_flight.is_zero()
    }

    /// Take the snapshot now instead of at the end of the window.
    pub fn flush_now(&self) {
        self.force.notify_one();
    }

    pub async fn run(&self, open_files: &OpenFilesStage, stopping: &CancellationToken) {
        loop {
            tokio::select! {
                _ = self.armed.notified() => {}
                _ = stopping.cancelled() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.window) => {}
                _ = self.force.notified() => {}
                _ = stopping.cancelled() => break,
            }

            self.flush(open_files).await;
        }
        debug!("Intake stage stopped");
    }

    /// One snapshot for everything pending, one reference per path.
    pub async fn flush(&self, open_files: &OpenFilesStage) {
        let _working = self.in_flight.enter();
        let paths = std::mem::take(&mut *lock(&self.pending)).paths;
        if paths.is_empty() {
            return;
        }

        let count = paths.len();
        let snapshots = Arc::clone(&self.snapshots);
        let result = tokio::task::spawn_blocking(move || {
            let tracker = take_shared_snapshot(&*snapshots)?;
            let references: Vec<SnapshotReference> =
                paths.into_iter().map(|path| tracker.add_reference(path)).collect();
            Ok::<_, crate::utils::errors::AgentError>(references)
        })
        .await;

        match result {
            Ok(Ok(references)) => {
                debug!(paths = count, "Shared snapshot taken for intake batch");
                open_files.add_all(references);
            }
            Ok(Err(e)) => error!(paths = count, error = %e, "Could not snapshot intake batch"),
            Err(e) => error!(paths = count, error = %e, "Intake snapshot task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CountingSnapshotProvider, ScriptedOpenFileHandles};

    fn open_files() -> OpenFilesStage {
        OpenFilesStage::new(
            Duration::from_millis(10),
            Duration::from_secs(60),
            Arc::new(ScriptedOpenFileHandles::default()),
        )
    }

    #[tokio::test]
    async fn test_batch_shares_one_snapshot() {
        let provider = Arc::new(CountingSnapshotProvider::pass_through());
        let intake = IntakeStage::new(Duration::from_secs(60), provider.clone());
        let open_files = open_files();

        intake.add("/a");
        intake.add("/b");
        intake.add("/a");
        assert_eq!(intake.len(), 2);

        intake.flush(&open_files).await;

        assert_eq!(provider.created(), 1);
        assert_eq!(open_files.len(), 2);
        assert!(intake.is_empty());
    }

    #[tokio::test]
    async fn test_window_elapses_then_flushes() {
        let provider = Arc::new(CountingSnapshotProvider::pass_through());
        let intake = Arc::new(IntakeStage::new(Duration::from_millis(30), provider.clone()));
        let open_files = Arc::new(open_files());
        let stopping = CancellationToken::new();

        let task = {
            let intake = Arc::clone(&intake);
            let open_files = Arc::clone(&open_files);
            let stopping = stopping.clone();
            tokio::spawn(async move { intake.run(&open_files, &stopping).await })
        };

        intake.add("/x");
        intake.add("/y");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(provider.created(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(provider.created(), 1);
        assert_eq!(open_files.len(), 2);

        stopping.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_failure_drops_batch() {
        let provider = Arc::new(CountingSnapshotProvider::pass_through());
        provider.set_failing(true);
        let intake = IntakeStage::new(Duration::from_secs(60), provider.clone());
        let open_files = open_files();

        intake.add("/a");
        intake.flush(&open_files).await;

        assert_eq!(open_files.len(), 0);
        assert!(intake.is_empty());
    }
}
