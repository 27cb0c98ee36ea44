//! Decoded change notifications and the typed events they become.

/// A path-level change, as consumed by the backup agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Update { path: String },
    Move { from: String, to: String },
    Delete { path: String },
}

impl MonitorEvent {
    /// Every path the event touches.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            MonitorEvent::Update { path } | MonitorEvent::Delete { path } => vec![path.as_str()],
            MonitorEvent::Move { from, to } => vec![from.as_str(), to.as_str()],
        }
    }
}

/// Event mask bits of a notification.
pub mod mask {
    pub const MODIFIED: u64 = 0x0000_0002;
    pub const MOVED_FROM: u64 = 0x0000_0040;
    pub const MOVED_TO: u64 = 0x0000_0080;
    pub const CHILD_DELETED: u64 = 0x0000_0200;
    pub const CHILD_MOVED: u64 = MOVED_FROM | MOVED_TO;

    /// Everything the agent marks mounts for.
    pub const WATCHED: u64 = MODIFIED | CHILD_DELETED | CHILD_MOVED;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoType {
    /// Directory handle plus entry name
    DirectoryAndName,
    /// Source side of a rename
    DirectoryAndNameFrom,
    /// Destination side of a rename
    DirectoryAndNameTo,
    Other(u8),
}

impl InfoType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            2 => InfoType::DirectoryAndName,
            10 => InfoType::DirectoryAndNameFrom,
            12 => InfoType::DirectoryAndNameTo,
            other => InfoType::Other(other),
        }
    }
}

/// One information record attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEventInfo {
    pub info_type: InfoType,
    pub file_system_id: i64,
    /// Opaque kernel file handle of the containing directory
    pub file_handle: Vec<u8>,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotifyEvent {
    pub mask: u64,
    pub process_id: i32,
    pub infos: Vec<NotifyEventInfo>,
}

impl NotifyEvent {
    pub fn has(&self, bits: u64) -> bool {
        self.mask & bits != 0
    }

    pub fn info(&self, info_type: InfoType) -> Option<&NotifyEventInfo> {
        self.infos.iter().find(|info| info.info_type == info_type)
    }
}
