//! FileSystemMonitor: turns decoded notifications into [`MonitorEvent`]s.
//!
//! The notification source marks whole filesystems, so every event carries
//! a filesystem id and a directory handle. Those are resolved through the
//! mount descriptor opened for that filesystem during setup.

pub mod event;
pub mod mount;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use event::{InfoType, MonitorEvent, NotifyEvent, NotifyEventInfo};
pub use mount::{Mount, MountHandle, MountTable, OpenByHandleAt, SurfaceArea};

use crate::utils::errors::{AgentError, Result};
use crate::utils::sync::lock;

/// The kernel notification source.
pub trait FileAccessNotify: Send + Sync {
    /// Watch the filesystem containing `path` for [`event::mask::WATCHED`].
    fn mark_path(&self, path: &Path) -> Result<()>;

    /// Deliver events until `cancel` fires, then return.
    fn monitor_events(
        &self,
        callback: &mut dyn FnMut(NotifyEvent),
        cancel: &CancellationToken,
    ) -> Result<()>;
}

const RESTART_DELAY: Duration = Duration::from_secs(1);

pub struct FileSystemMonitor {
    surface_area: Arc<dyn SurfaceArea>,
    mount_table: Arc<dyn MountTable>,
    notify: Arc<dyn FileAccessNotify>,
    open_by_handle_at: Arc<dyn OpenByHandleAt>,
    mount_descriptors: Mutex<HashMap<i64, i32>>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    stopping: CancellationToken,
}

impl FileSystemMonitor {
    pub fn new(
        surface_area: Arc<dyn SurfaceArea>,
        mount_table: Arc<dyn MountTable>,
        notify: Arc<dyn FileAccessNotify>,
        open_by_handle_at: Arc<dyn OpenByHandleAt>,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let monitor = Self {
            surface_area,
            mount_table,
            notify,
            open_by_handle_at,
            mount_descriptors: Mutex::new(HashMap::new()),
            events,
            stopping: CancellationToken::new(),
        };
        (monitor, receiver)
    }

    pub fn mount_descriptor(&self, file_system_id: i64) -> Option<i32> {
        lock(&self.mount_descriptors).get(&file_system_id).copied()
    }

    /// Mark every mount of the surface area and remember its descriptor.
    ///
    /// Pool-backed mounts (ZFS) cannot have their device tested, but their
    /// mount point still opens a usable descriptor, so they are treated the same.
    pub fn set_up_file_access_notify(&self) -> Result<()> {
        let mounts = self.surface_area.mounts();
        let mut failures = 0;

        for mount in &mounts {
            if let Err(e) = self.notify.mark_path(Path::new(&mount.mount_point)) {
                error!(mount_point = %mount.mount_point, error = %e, "Failed to mark mount");
                failures += 1;
                continue;
            }

            match self.mount_table.open_mount_for_file_system(&mount.mount_point) {
                Ok(handle) => {
                    lock(&self.mount_descriptors)
                        .insert(handle.file_system_id, handle.file_descriptor);
                    debug!(
                        mount_point = %mount.mount_point,
                        fs_type = %mount.file_system_type,
                        device_accessible = mount.test_device_access(),
                        "Watching mount"
                    );
                }
                Err(e) => {
                    error!(mount_point = %mount.mount_point, error = %e, "Failed to open mount");
                    failures += 1;
                }
            }
        }

        info!(mounts = mounts.len(), failures, "File access notification set up");
        if failures > 0 && failures == mounts.len() {
            return Err(AgentError::Monitor("no mount could be watched".to_string()));
        }
        Ok(())
    }

    fn resolve(&self, info: &NotifyEventInfo) -> Option<String> {
        let Some(mount_descriptor) = self.mount_descriptor(info.file_system_id) else {
            debug!(fsid = info.file_system_id, "Event for an unwatched filesystem");
            return None;
        };

        match self.open_by_handle_at.open(mount_descriptor, &info.file_handle) {
            Ok(directory) => {
                let path: PathBuf = directory.join(&info.file_name);
                Some(path.to_string_lossy().into_owned())
            }
            Err(e) => {
                // The directory may already be gone
                debug!(file_name = %info.file_name, error = %e, "Could not resolve directory handle");
                None
            }
        }
    }

    fn emit(&self, event: MonitorEvent) {
        if self.events.send(event).is_err() {
            debug!("Monitor event dropped: receiver closed");
        }
    }

    /// Dispatch one decoded notification as at most one [`MonitorEvent`].
    pub fn process_event(&self, event: &NotifyEvent) {
        if event.has(event::mask::CHILD_MOVED) {
            let from = event
                .info(InfoType::DirectoryAndNameFrom)
                .and_then(|info| self.resolve(info));
            let to = event
                .info(InfoType::DirectoryAndNameTo)
                .and_then(|info| self.resolve(info));

            match (from, to) {
                (Some(from), Some(to)) => self.emit(MonitorEvent::Move { from, to }),
                // Moved out of view
                (Some(path), None) => self.emit(MonitorEvent::Delete { path }),
                // Moved into view
                (None, Some(path)) => self.emit(MonitorEvent::Update { path }),
                (None, None) => {}
            }
            return;
        }

        let Some(path) = event
            .info(InfoType::DirectoryAndName)
            .and_then(|info| self.resolve(info))
        else {
            return;
        };

        if event.has(event::mask::CHILD_DELETED) {
            self.emit(MonitorEvent::Delete { path });
        } else if event.has(event::mask::MODIFIED) {
            self.emit(MonitorEvent::Update { path });
        }
    }

    /// Runs the notification loop on the calling thread until stopped.
    pub fn monitor_file_activity(&self) {
        while !self.stopping.is_cancelled() {
            let mut callback = |event: NotifyEvent| self.process_event(&event);
            if let Err(e) = self.notify.monitor_events(&mut callback, &self.stopping) {
                error!(error = %e, "File access notification failed, restarting");
                std::thread::sleep(RESTART_DELAY);
            }
        }
        info!("File system monitor stopped");
    }

    /// Run [`Self::monitor_file_activity`] on a dedicated thread.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let monitor = Arc::clone(self);
        std::thread::Builder::new()
            .name("fs-monitor".to_string())
            .spawn(move || monitor.monitor_file_activity())
            .map_err(AgentError::Io)
    }

    pub fn stop(&self) {
        if !self.stopping.is_cancelled() {
            warn!("Stopping file system monitor");
        }
        self.stopping.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct FakeNotify {
        marked: Mutex<Vec<PathBuf>>,
        events: Mutex<Vec<NotifyEvent>>,
    }

    impl FileAccessNotify for FakeNotify {
        fn mark_path(&self, path: &Path) -> Result<()> {
            lock(&self.marked).push(path.to_path_buf());
            Ok(())
        }

        fn monitor_events(
            &self,
            callback: &mut dyn FnMut(NotifyEvent),
            cancel: &CancellationToken,
        ) -> Result<()> {
            for event in lock(&self.events).drain(..).collect::<Vec<_>>() {
                callback(event);
            }
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }
    }

    /// Hands out a distinct descriptor and filesystem id per mount point.
    #[derive(Default)]
    struct FakeMountTable {
        opened: Mutex<HashMap<String, MountHandle>>,
    }

    impl MountTable for FakeMountTable {
        fn open_mount_for_file_system(&self, mount_point: &str) -> Result<MountHandle> {
            let mut opened = lock(&self.opened);
            let n = opened.len() as i32;
            let handle = MountHandle {
                file_descriptor: 100 + n,
                file_system_id: 0x5000_0000 + i64::from(n) * 7,
            };
            opened.insert(mount_point.to_string(), handle);
            Ok(handle)
        }
    }

    /// The handle bytes are the directory path.
    #[derive(Default)]
    struct FakeOpenByHandleAt {
        calls: Mutex<Vec<(i32, Vec<u8>)>>,
    }

    impl OpenByHandleAt for FakeOpenByHandleAt {
        fn open(&self, mount_descriptor: i32, file_handle: &[u8]) -> Result<PathBuf> {
            lock(&self.calls).push((mount_descriptor, file_handle.to_vec()));
            Ok(PathBuf::from(String::from_utf8_lossy(file_handle).into_owned()))
        }
    }

    struct FixedSurfaceArea(Vec<Mount>);

    impl SurfaceArea for FixedSurfaceArea {
        fn mounts(&self) -> Vec<Mount> {
            self.0.clone()
        }
    }

    struct Harness {
        monitor: Arc<FileSystemMonitor>,
        receiver: mpsc::UnboundedReceiver<MonitorEvent>,
        notify: Arc<FakeNotify>,
        mount_table: Arc<FakeMountTable>,
        open_by_handle_at: Arc<FakeOpenByHandleAt>,
    }

    fn harness(mounts: Vec<Mount>) -> Harness {
        let notify = Arc::new(FakeNotify::default());
        let mount_table = Arc::new(FakeMountTable::default());
        let open_by_handle_at = Arc::new(FakeOpenByHandleAt::default());
        let (monitor, receiver) = FileSystemMonitor::new(
            Arc::new(FixedSurfaceArea(mounts)),
            mount_table.clone(),
            notify.clone(),
            open_by_handle_at.clone(),
        );
        Harness {
            monitor: Arc::new(monitor),
            receiver,
            notify,
            mount_table,
            open_by_handle_at,
        }
    }

    fn info(info_type: InfoType, fsid: i64, directory: &str, name: &str) -> NotifyEventInfo {
        NotifyEventInfo {
            info_type,
            file_system_id: fsid,
            file_handle: directory.as_bytes().to_vec(),
            file_name: name.to_string(),
        }
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_dispatches_update() {
        let mut h = harness(Vec::new());
        lock(&h.monitor.mount_descriptors).insert(77, 9);

        h.monitor.process_event(&NotifyEvent {
            mask: event::mask::MODIFIED,
            process_id: 1,
            infos: vec![info(InfoType::DirectoryAndName, 77, "/srv/data", "report.txt")],
        });

        assert_eq!(
            drain(&mut h.receiver),
            vec![MonitorEvent::Update {
                path: "/srv/data/report.txt".to_string()
            }]
        );
        assert_eq!(
            lock(&h.open_by_handle_at.calls).clone(),
            vec![(9, b"/srv/data".to_vec())]
        );
    }

    #[test]
    fn test_dispatches_move_with_both_endpoints() {
        let mut h = harness(Vec::new());
        lock(&h.monitor.mount_descriptors).insert(1, 10);
        lock(&h.monitor.mount_descriptors).insert(2, 20);

        h.monitor.process_event(&NotifyEvent {
            mask: event::mask::CHILD_MOVED,
            process_id: 1,
            infos: vec![
                info(InfoType::DirectoryAndNameFrom, 1, "/old", "a.txt"),
                info(InfoType::DirectoryAndNameTo, 2, "/new", "b.txt"),
            ],
        });

        assert_eq!(
            drain(&mut h.receiver),
            vec![MonitorEvent::Move {
                from: "/old/a.txt".to_string(),
                to: "/new/b.txt".to_string()
            }]
        );
        assert_eq!(lock(&h.open_by_handle_at.calls).len(), 2);
    }

    #[test]
    fn test_dispatches_delete() {
        let mut h = harness(Vec::new());
        lock(&h.monitor.mount_descriptors).insert(5, 50);

        h.monitor.process_event(&NotifyEvent {
            mask: event::mask::CHILD_DELETED,
            process_id: 1,
            infos: vec![info(InfoType::DirectoryAndName, 5, "/tmp", "gone")],
        });

        assert_eq!(
            drain(&mut h.receiver),
            vec![MonitorEvent::Delete {
                path: "/tmp/gone".to_string()
            }]
        );
    }

    #[test]
    fn test_half_visible_moves() {
        let mut h = harness(Vec::new());
        lock(&h.monitor.mount_descriptors).insert(1, 10);

        h.monitor.process_event(&NotifyEvent {
            mask: event::mask::MOVED_FROM,
            process_id: 1,
            infos: vec![info(InfoType::DirectoryAndNameFrom, 1, "/w", "out")],
        });
        h.monitor.process_event(&NotifyEvent {
            mask: event::mask::MOVED_TO,
            process_id: 1,
            infos: vec![info(InfoType::DirectoryAndNameTo, 1, "/w", "in")],
        });

        assert_eq!(
            drain(&mut h.receiver),
            vec![
                MonitorEvent::Delete {
                    path: "/w/out".to_string()
                },
                MonitorEvent::Update {
                    path: "/w/in".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_unknown_filesystem_is_ignored() {
        let mut h = harness(Vec::new());
        h.monitor.process_event(&NotifyEvent {
            mask: event::mask::MODIFIED,
            process_id: 1,
            infos: vec![info(InfoType::DirectoryAndName, 404, "/x", "y")],
        });
        assert!(drain(&mut h.receiver).is_empty());
        assert!(lock(&h.open_by_handle_at.calls).is_empty());
    }

    #[test]
    fn test_set_up_marks_every_mount() {
        let mut mounts = Vec::new();
        for i in 0..10 {
            mounts.push(Mount {
                device_name: format!("/dev/disk{}", i),
                root: "/".to_string(),
                mount_point: format!("/mnt/ext{}", i),
                file_system_type: "ext4".to_string(),
                options: "rw".to_string(),
            });
        }
        for i in 0..10 {
            mounts.push(Mount {
                device_name: format!("rpool/ROOT/set{}", i),
                root: "/".to_string(),
                mount_point: format!("/pool/set{}", i),
                file_system_type: "zfs".to_string(),
                options: "rw".to_string(),
            });
        }
        let h = harness(mounts.clone());

        h.monitor.set_up_file_access_notify().unwrap();

        let marked = lock(&h.notify.marked).clone();
        let opened = lock(&h.mount_table.opened).clone();
        for mount in &mounts {
            assert!(marked.contains(&PathBuf::from(&mount.mount_point)));
            let handle = opened[&mount.mount_point];
            assert_eq!(
                h.monitor.mount_descriptor(handle.file_system_id),
                Some(handle.file_descriptor)
            );
        }
    }

    #[test]
    fn test_stop_ends_monitoring_promptly() {
        let h = harness(Vec::new());
        h.monitor.set_up_file_access_notify().unwrap();

        let delay_before_stop = Duration::from_millis(250);
        let monitor = Arc::clone(&h.monitor);
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(delay_before_stop);
            monitor.stop();
        });

        let started = Instant::now();
        h.monitor.monitor_file_activity();
        let elapsed = started.elapsed();
        stopper.join().unwrap();

        assert!(elapsed >= delay_before_stop);
        assert!(elapsed < delay_before_stop + Duration::from_millis(50));
    }

    #[test]
    fn test_events_flow_through_the_loop() {
        let mut h = harness(Vec::new());
        lock(&h.monitor.mount_descriptors).insert(3, 30);
        lock(&h.notify.events).push(NotifyEvent {
            mask: event::mask::MODIFIED,
            process_id: 1,
            infos: vec![info(InfoType::DirectoryAndName, 3, "/d", "f")],
        });

        let thread = h.monitor.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        h.monitor.stop();
        thread.join().unwrap();

        assert_eq!(
            drain(&mut h.receiver),
            vec![MonitorEvent::Update {
                path: "/d/f".to_string()
            }]
        );
    }
}
