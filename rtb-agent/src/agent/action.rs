//! Work items flowing between the pipeline stages.

use std::fs::File;
use std::io::{self, Seek, SeekFrom};

use crate::fs::staging::StagedFile;
use crate::snapshot::SnapshotReference;
use crate::state::FileState;
use crate::storage::UploadReader;

#[derive(Debug)]
pub enum BackupAction {
    /// Upload the content a snapshot holds for its path.
    Upload(SnapshotReference),
    Move { from: String, to: String },
    Delete { path: String },
}

impl BackupAction {
    pub fn path(&self) -> &str {
        match self {
            BackupAction::Upload(reference) => reference.path(),
            BackupAction::Move { from, .. } => from,
            BackupAction::Delete { path } => path,
        }
    }
}

/// Content ready to be uploaded.
///
/// Small files are staged so their snapshot can go right away. Larger ones
/// keep the snapshot, and the open file inside it, for the whole upload.
pub enum FileReference {
    Snapshot {
        reference: SnapshotReference,
        file: File,
    },
    Staged(StagedFile),
}

impl FileReference {
    /// A reader positioned at the start of the content.
    pub fn open_reader(&mut self) -> io::Result<UploadReader> {
        let file = match self {
            FileReference::Snapshot { file, .. } => {
                file.seek(SeekFrom::Start(0))?;
                file.try_clone()?
            }
            FileReference::Staged(staged) => File::open(staged.path())?,
        };
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    pub fn is_staged(&self) -> bool {
        matches!(self, FileReference::Staged(_))
    }
}

/// A file whose content differs from what the cache last recorded.
pub struct UploadItem {
    pub path: String,
    /// Recorded in the cache, with its content key, once uploaded.
    pub state: FileState,
    pub source: FileReference,
}
