//! Long polling: files that stay open for writing are promoted once their
//! content stops changing between snapshots, or at their deadline.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::action::BackupAction;
use super::queue::{InFlight, LifoQueue};
use crate::fs::compare::files_are_equal;
use crate::fs::open_handles::{is_open_for_write, OpenFileHandles};
use crate::snapshot::{take_shared_snapshot, SnapshotProvider, SnapshotReference};
use crate::utils::sync::lock;

struct LongPollEntry {
    reference: SnapshotReference,
    /// Uploaded regardless once this passes.
    deadline: Instant,
}

pub struct LongPollingStage {
    entries: Mutex<Vec<LongPollEntry>>,
    next_cycle: Mutex<Option<Instant>>,
    arrived: Notify,
    interval: Duration,
    maximum_time: Duration,
    snapshots: Arc<dyn SnapshotProvider>,
    open_handles: Arc<dyn OpenFileHandles>,
    in_flight: InFlight,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub promoted: usize,
    pub still_changing: usize,
}

impl LongPollingStage {
    pub fn new(
        interval: Duration,
        maximum_time: Duration,
        snapshots: Arc<dyn SnapshotProvider>,
        open_handles: Arc<dyn OpenFileHandles>,
    ) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_cycle: Mutex::new(None),
            arrived: Notify::new(),
            interval,
            maximum_time,
            snapshots,
            open_handles,
            in_flight: InFlight::default(),
        }
    }

    pub fn add(&self, reference: SnapshotReference) {
        let deadline = Instant::now() + self.maximum_time;
        lock(&self.entries).push(LongPollEntry { reference, deadline });
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

    /// The next scheduled interval, pulled forward to the earliest deadline.
    fn next_wake(&self) -> Instant {
        let earliest_deadline = lock(&self.entries).iter().map(|e| e.deadline).min();
        let mut next_cycle = lock(&self.next_cycle);
        let scheduled = *next_cycle.get_or_insert_with(|| Instant::now() + self.interval);
        let wake = match earliest_deadline {
            Some(deadline) if deadline < scheduled => deadline,
            _ => scheduled,
        };
        *next_cycle = Some(wake);
        wake
    }

    pub async fn run(&self, backup_queue: &LifoQueue<BackupAction>, stopping: &CancellationToken) {
        loop {
            if self.is_empty() {
                tokio::select! {
                    _ = self.arrived.notified() => continue,
                    _ = stopping.cancelled() => break,
                }
            }

            let wake = self.next_wake();
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                // A new deadline may be earlier than the current wake
                _ = self.arrived.notified() => continue,
                _ = stopping.cancelled() => break,
            }

            *lock(&self.next_cycle) = None;
            self.cycle(backup_queue, stopping).await;
        }
        debug!("Long polling stopped");
    }

    /// One fresh snapshot for every entry, then promote what has settled.
    pub async fn cycle(
        &self,
        backup_queue: &LifoQueue<BackupAction>,
        stopping: &CancellationToken,
    ) -> CycleOutcome {
        let _working = self.in_flight.enter();
        let entries = std::mem::take(&mut *lock(&self.entries));
        if entries.is_empty() {
            return CycleOutcome::default();
        }

        let snapshots = Arc::clone(&self.snapshots);
        let open_handles = Arc::clone(&self.open_handles);
        let cancel = stopping.clone();
        let result = tokio::task::spawn_blocking(move || {
            let tracker = match take_shared_snapshot(&*snapshots) {
                Ok(tracker) => tracker,
                Err(e) => return Err((e, entries)),
            };

            let now = Instant::now();
            let mut promoted = Vec::new();
            let mut kept = Vec::new();
            for entry in entries {
                let path = entry.reference.path().to_string();
                let newer = tracker.add_reference(path.as_str());

                if entry.deadline <= now || !is_open_for_write(&*open_handles, Path::new(&path)) {
                    entry.reference.release();
                    promoted.push(BackupAction::Upload(newer));
                    continue;
                }

                let equal = files_are_equal(
                    entry.reference.snapshotted_path(),
                    newer.snapshotted_path(),
                    &cancel,
                );
                entry.reference.release();

                match equal {
                    Ok(true) => promoted.push(BackupAction::Upload(newer)),
                    Ok(false) => kept.push(LongPollEntry {
                        reference: newer,
                        deadline: entry.deadline,
                    }),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => kept.push(LongPollEntry {
                        reference: newer,
                        deadline: entry.deadline,
                    }),
                    Err(e) => {
                        warn!(path = %path, error = %e, "Snapshot comparison failed, uploading");
                        promoted.push(BackupAction::Upload(newer));
                    }
                }
            }
            Ok((promoted, kept))
        })
        .await;

        let (promoted, kept) = match result {
            Ok(Ok(decided)) => decided,
            Ok(Err((e, entries))) => {
                error!(error = %e, "Could not snapshot long polling entries");
                self.restore(entries);
                return CycleOutcome::default();
            }
            Err(e) => {
                error!(error = %e, "Long polling task failed");
                return CycleOutcome::default();
            }
        };

        let outcome = CycleOutcome {
            promoted: promoted.len(),
            still_changing: kept.len(),
        };
        if outcome.promoted > 0 {
            debug!(promoted = outcome.promoted, "Long polling promoted settled files");
        }
        backup_queue.push_all(promoted);
        self.restore(kept);
        outcome
    }

    fn restore(&self, older: Vec<LongPollEntry>) {
        let mut entries = lock(&self.entries);
        let arrived = std::mem::replace(&mut *entries, older);
        entries.extend(arrived);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotReferenceTracker;
    use crate::test_support::{CountingSnapshotProvider, ScriptedOpenFileHandles};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        file: String,
        provider: Arc<CountingSnapshotProvider>,
        handles: Arc<ScriptedOpenFileHandles>,
        backup_queue: LifoQueue<BackupAction>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("live");
        fs::create_dir_all(&source).unwrap();
        let file = source.join("growing.log");
        fs::write(&file, b"first").unwrap();

        Fixture {
            provider: Arc::new(CountingSnapshotProvider::copying(&source, dir.path().join("snapshots"))),
            file: file.to_string_lossy().into_owned(),
            _dir: dir,
            handles: Arc::new(ScriptedOpenFileHandles::default()),
            backup_queue: LifoQueue::new(),
        }
    }

    fn stage(f: &Fixture, maximum_time: Duration) -> LongPollingStage {
        LongPollingStage::new(
            Duration::from_millis(20),
            maximum_time,
            f.provider.clone(),
            f.handles.clone(),
        )
    }

    fn initial_reference(f: &Fixture) -> SnapshotReference {
        let tracker = take_shared_snapshot(&*f.provider).unwrap();
        tracker.add_reference(f.file.as_str())
    }

    #[tokio::test]
    async fn test_changing_file_waits_until_stable() {
        let f = fixture();
        let stage = stage(&f, Duration::from_secs(600));
        f.handles.open_for_write(&f.file);
        stage.add(initial_reference(&f));

        fs::write(&f.file, b"first and second").unwrap();
        let outcome = stage.cycle(&f.backup_queue, &CancellationToken::new()).await;
        assert_eq!(outcome.still_changing, 1);
        assert!(f.backup_queue.is_empty());
        assert_eq!(f.provider.live(), 1);

        let outcome = stage.cycle(&f.backup_queue, &CancellationToken::new()).await;
        assert_eq!(outcome.promoted, 1);
        assert!(stage.is_empty());
        assert_eq!(f.provider.live(), 1);

        match f.backup_queue.try_pop() {
            Some(BackupAction::Upload(reference)) => {
                assert_eq!(fs::read(reference.snapshotted_path()).unwrap(), b"first and second");
            }
            other => panic!("expected an upload, got {:?}", other),
        }
        assert_eq!(f.provider.live(), 0);
    }

    #[tokio::test]
    async fn test_closed_file_promoted_without_compare() {
        let f = fixture();
        let stage = stage(&f, Duration::from_secs(600));
        stage.add(initial_reference(&f));
        fs::write(&f.file, b"changed").unwrap();

        let outcome = stage.cycle(&f.backup_queue, &CancellationToken::new()).await;

        assert_eq!(outcome.promoted, 1);
        assert_eq!(f.backup_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_forces_promotion() {
        let f = fixture();
        let stage = stage(&f, Duration::ZERO);
        f.handles.open_for_write(&f.file);
        stage.add(initial_reference(&f));
        fs::write(&f.file, b"still being written").unwrap();

        let outcome = stage.cycle(&f.backup_queue, &CancellationToken::new()).await;

        assert_eq!(outcome.promoted, 1);
        assert_eq!(outcome.still_changing, 0);
    }

    #[tokio::test]
    async fn test_snapshot_failure_keeps_entries() {
        let f = fixture();
        let stage = stage(&f, Duration::from_secs(600));
        f.handles.open_for_write(&f.file);
        stage.add(initial_reference(&f));
        f.provider.set_failing(true);

        let outcome = stage.cycle(&f.backup_queue, &CancellationToken::new()).await;

        assert_eq!(outcome, CycleOutcome::default());
        assert_eq!(stage.len(), 1);
        assert_eq!(f.provider.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arrival_with_earlier_deadline_pulls_cycle_forward() {
        let f = fixture();
        let stage = LongPollingStage::new(
            Duration::from_secs(60),
            Duration::from_secs(5),
            f.provider.clone(),
            f.handles.clone(),
        );
        let start = Instant::now();

        assert_eq!(stage.next_wake(), start + Duration::from_secs(60));

        stage.add(initial_reference(&f));
        assert_eq!(stage.next_wake(), start + Duration::from_secs(5));

        // The earlier wake sticks once scheduled
        tokio::time::advance(Duration::from_secs(2)).await;
        stage.add(initial_reference(&f));
        assert_eq!(stage.next_wake(), start + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_promotes_open_file_at_deadline() {
        let f = fixture();
        let stage = Arc::new(LongPollingStage::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
            f.provider.clone(),
            f.handles.clone(),
        ));
        let backup_queue = Arc::new(LifoQueue::new());
        let stopping = CancellationToken::new();
        f.handles.open_for_write(&f.file);

        let task = {
            let stage = Arc::clone(&stage);
            let backup_queue = Arc::clone(&backup_queue);
            let stopping = stopping.clone();
            tokio::spawn(async move { stage.run(&backup_queue, &stopping).await })
        };

        stage.add(initial_reference(&f));
        fs::write(&f.file, b"first and still growing").unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(backup_queue.is_empty());
        assert_eq!(stage.len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backup_queue.len(), 1);
        assert!(stage.is_empty());
        assert_eq!(f.provider.live(), 1);

        stopping.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_promotes_on_schedule() {
        let f = fixture();
        let stage = Arc::new(stage(&f, Duration::from_secs(600)));
        let backup_queue = Arc::new(LifoQueue::new());
        let stopping = CancellationToken::new();

        let task = {
            let stage = Arc::clone(&stage);
            let backup_queue = Arc::clone(&backup_queue);
            let stopping = stopping.clone();
            tokio::spawn(async move { stage.run(&backup_queue, &stopping).await })
        };

        let tracker = SnapshotReferenceTracker::new(f.provider.create_snapshot("RTB-1").unwrap());
        stage.add(tracker.add_reference(f.file.as_str()));
        drop(tracker);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backup_queue.len(), 1);

        stopping.cancel();
        task.await.unwrap();
    }
}
