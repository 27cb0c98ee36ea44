//! The backup pipeline.
//!
//! Change events enter the intake stage, which batches paths onto one shared
//! snapshot. Files still open for writing wait in open-file polling, then in
//! long polling if their writers never let go. Settled files become backup
//! actions, applied one at a time against the state cache, and the resulting
//! uploads are spread over a pool of workers.

pub mod action;
pub mod backup_queue;
pub mod intake;
pub mod long_polling;
pub mod open_files;
pub mod queue;
pub mod upload;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use action::{BackupAction, FileReference, UploadItem};

use backup_queue::BackupQueueStage;
use intake::IntakeStage;
use long_polling::LongPollingStage;
use open_files::OpenFilesStage;
use upload::UploadPool;

use crate::config::PipelineConfig;
use crate::fs::checksum::Checksum;
use crate::fs::open_handles::OpenFileHandles;
use crate::fs::staging::Staging;
use crate::monitor::{FileSystemMonitor, MonitorEvent};
use crate::snapshot::SnapshotProvider;
use crate::state::RemoteFileStateCache;
use crate::storage::RemoteStorage;
use crate::utils::errors::Result;
use crate::utils::sync::lock;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const BACKUP_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Everything the pipeline talks to.
pub struct AgentCollaborators {
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub open_handles: Arc<dyn OpenFileHandles>,
    pub staging: Arc<dyn Staging>,
    pub checksum: Arc<dyn Checksum>,
    pub storage: Arc<dyn RemoteStorage>,
    pub cache: Arc<RemoteFileStateCache>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSizes {
    pub pending_intake: usize,
    pub polling_open_handles: usize,
    pub polling_content_changes: usize,
    pub backup_actions: usize,
    pub queued_uploads: usize,
}

impl QueueSizes {
    pub fn total(&self) -> usize {
        self.pending_intake
            + self.polling_open_handles
            + self.polling_content_changes
            + self.backup_actions
            + self.queued_uploads
    }
}

#[derive(Default)]
struct PauseState {
    paused: bool,
    paths: BTreeSet<String>,
}

#[derive(Default)]
struct AgentTasks {
    stages: Vec<JoinHandle<()>>,
    backup: Option<JoinHandle<()>>,
    uploads: Vec<JoinHandle<()>>,
    monitor: Option<(Arc<FileSystemMonitor>, std::thread::JoinHandle<()>)>,
}

pub struct BackupAgent {
    config: PipelineConfig,
    intake: IntakeStage,
    open_files: OpenFilesStage,
    long_polling: LongPollingStage,
    backup_queue: BackupQueueStage,
    uploads: Arc<UploadPool>,
    cache: Arc<RemoteFileStateCache>,
    pause: Mutex<PauseState>,
    /// Wakes every stage for shutdown.
    stopping: CancellationToken,
    /// Interrupts the backup-action stage once its drain grace is over.
    backup_cancel: CancellationToken,
    /// Interrupts in-flight uploads.
    upload_cancel: CancellationToken,
    tasks: Mutex<AgentTasks>,
}

impl BackupAgent {
    pub fn new(config: PipelineConfig, collaborators: AgentCollaborators) -> Self {
        let AgentCollaborators {
            snapshots,
            open_handles,
            staging,
            checksum,
            storage,
            cache,
        } = collaborators;

        Self {
            intake: IntakeStage::new(config.snapshot_sharing_window(), Arc::clone(&snapshots)),
            open_files: OpenFilesStage::new(
                config.open_file_handle_polling_interval(),
                config.maximum_time_to_wait_for_no_open_file_handles(),
                Arc::clone(&open_handles),
            ),
            long_polling: LongPollingStage::new(
                config.long_polling_interval(),
                config.maximum_long_polling_time(),
                snapshots,
                open_handles,
            ),
            backup_queue: BackupQueueStage::new(
                Arc::clone(&cache),
                Arc::clone(&storage),
                checksum,
                staging,
                config.maximum_file_size_for_staging_copy,
            ),
            uploads: Arc::new(UploadPool::new(
                config.upload_thread_count,
                storage,
                Arc::clone(&cache),
            )),
            cache,
            pause: Mutex::new(PauseState::default()),
            stopping: CancellationToken::new(),
            backup_cancel: CancellationToken::new(),
            upload_cancel: CancellationToken::new(),
            tasks: Mutex::new(AgentTasks::default()),
            config,
        }
    }

    pub fn cache(&self) -> &Arc<RemoteFileStateCache> {
        &self.cache
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    /// Route one change event, or remember its paths while paused.
    pub fn handle_event(&self, event: MonitorEvent) {
        {
            let mut pause = lock(&self.pause);
            if pause.paused {
                pause.paths.extend(event.paths().into_iter().map(str::to_string));
                return;
            }
        }
        self.route(event);
    }

    fn route(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::Update { path } => self.intake.add(path),
            MonitorEvent::Move { from, to } => {
                debug!(from = %from, to = %to, "Move queued");
                self.backup_queue.actions().push(BackupAction::Move { from, to });
            }
            MonitorEvent::Delete { path } => {
                debug!(path = %path, "Delete queued");
                self.backup_queue.actions().push(BackupAction::Delete { path });
            }
        }
    }

    /// Back up `path` if it exists, otherwise forget it. Not held back by a pause.
    pub fn check_path(&self, path: &str) {
        if Path::new(path).is_file() {
            self.route(MonitorEvent::Update {
                path: path.to_string(),
            });
        } else if self.cache.contains_path(path) {
            self.route(MonitorEvent::Delete {
                path: path.to_string(),
            });
        }
    }

    pub fn check_paths<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for path in paths {
            self.check_path(path.as_ref());
        }
    }

    pub fn notify_move(&self, from: &str, to: &str) {
        self.handle_event(MonitorEvent::Move {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    /// Hold events back, recording only the paths they touch.
    pub fn pause_monitor(&self) {
        lock(&self.pause).paused = true;
        info!("Monitor paused");
    }

    /// Replay every path recorded while paused against the current disk state.
    /// Returns how many paths were replayed.
    pub fn unpause_monitor(&self) -> usize {
        let paths = {
            let mut pause = lock(&self.pause);
            pause.paused = false;
            std::mem::take(&mut pause.paths)
        };

        let count = paths.len();
        for path in paths {
            if Path::new(&path).is_file() {
                self.intake.add(path);
            } else {
                self.backup_queue.actions().push(BackupAction::Delete { path });
            }
        }
        info!(replayed = count, "Monitor resumed");
        count
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.pause).paused
    }

    /// Paths waiting for a snapshot or for their writers to close.
    pub fn open_files_count(&self) -> usize {
        self.intake.len() + self.open_files.len()
    }

    pub fn queue_sizes(&self) -> QueueSizes {
        QueueSizes {
            pending_intake: self.intake.len(),
            polling_open_handles: self.open_files.len(),
            polling_content_changes: self.long_polling.len(),
            backup_actions: self.backup_queue.len(),
            queued_uploads: self.uploads.len(),
        }
    }

    /// Nothing queued and nothing being worked on, checked upstream first.
    pub fn is_idle(&self) -> bool {
        self.intake.is_idle()
            && self.open_files.is_idle()
            && self.long_polling.is_idle()
            && self.backup_queue.is_idle()
            && self.uploads.is_idle()
    }

    /// Wait until every stage is idle. Returns false if stopped first.
    pub async fn wait_for_idle(&self) -> bool {
        loop {
            if self.is_idle() {
                return true;
            }
            if !self.intake.is_empty() {
                self.intake.flush_now();
            }
            tokio::select! {
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                _ = self.stopping.cancelled() => return false,
            }
        }
    }

    /// Start every stage, the upload workers and cache maintenance.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);

        let agent = Arc::clone(self);
        tasks.stages.push(tokio::spawn(async move {
            agent.intake.run(&agent.open_files, &agent.stopping).await
        }));

        let agent = Arc::clone(self);
        tasks.stages.push(tokio::spawn(async move {
            agent
                .open_files
                .run(&agent.long_polling, agent.backup_queue.actions(), &agent.stopping)
                .await
        }));

        let agent = Arc::clone(self);
        tasks.stages.push(tokio::spawn(async move {
            agent
                .long_polling
                .run(agent.backup_queue.actions(), &agent.stopping)
                .await
        }));

        let agent = Arc::clone(self);
        tasks.backup = Some(tokio::spawn(async move {
            agent
                .backup_queue
                .run(&agent.uploads, &agent.stopping, &agent.backup_cancel)
                .await
        }));

        tasks.uploads = self.uploads.start(&self.upload_cancel);
        self.cache.start_maintenance();

        info!(
            upload_workers = self.config.upload_thread_count,
            "Backup agent started"
        );
    }

    /// Start, then feed events from `events` until stopped.
    pub fn start_with_events(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<MonitorEvent>) {
        self.start();

        let agent = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => agent.handle_event(event),
                        None => break,
                    },
                    _ = agent.stopping.cancelled() => break,
                }
            }
            debug!("Event intake stopped");
        });
        lock(&self.tasks).stages.push(task);
    }

    /// Set up file access notification on the monitor's thread and start.
    pub fn start_with_monitor(
        self: &Arc<Self>,
        monitor: Arc<FileSystemMonitor>,
        events: mpsc::UnboundedReceiver<MonitorEvent>,
    ) -> Result<()> {
        monitor.set_up_file_access_notify()?;
        let thread = monitor.start()?;
        lock(&self.tasks).monitor = Some((monitor, thread));
        self.start_with_events(events);
        Ok(())
    }

    /// Stop every stage.
    ///
    /// The backup-action stage gets its drain grace before it is cancelled.
    /// Uploads are interrupted, then the state cache makes its final upload.
    pub async fn stop(&self) {
        info!("Stopping backup agent");
        self.stopping.cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        if let Some((monitor, _)) = &tasks.monitor {
            monitor.stop();
        }

        for stage in tasks.stages {
            if let Err(e) = stage.await {
                warn!(error = %e, "Pipeline stage failed");
            }
        }

        if let Some(mut backup) = tasks.backup {
            let grace = self.config.backup_queue_drain_grace();
            if tokio::time::timeout(grace, &mut backup).await.is_err() {
                warn!(
                    remaining = self.backup_queue.len(),
                    "Backup queue did not drain in time, cancelling"
                );
                self.backup_cancel.cancel();
                if tokio::time::timeout(BACKUP_CANCEL_GRACE, &mut backup).await.is_err() {
                    backup.abort();
                }
            }
        }

        self.upload_cancel.cancel();
        for worker in tasks.uploads {
            if let Err(e) = worker.await {
                warn!(error = %e, "Upload worker failed");
            }
        }

        self.cache.stop();
        self.cache.wait_while_busy().await;

        if let Some((_, thread)) = tasks.monitor {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!("File system monitor thread panicked"),
                Err(e) => warn!(error = %e, "Could not join the file system monitor"),
            }
        }

        let abandoned = self.intake.clear()
            + self.open_files.clear()
            + self.long_polling.clear()
            + self.backup_queue.actions().clear()
            + self.uploads.queue().clear();
        if abandoned > 0 {
            info!(abandoned, "Released unfinished work");
        }
        info!("Backup agent stopped");
    }
}
