//! Staging area: local copies of small files so their snapshot can be released early.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Makes a durable local copy of a stream.
pub trait Staging: Send + Sync {
    fn stage_file(&self, content: &mut dyn Read) -> io::Result<StagedFile>;
}

/// A staged copy. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
    len: u64,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Stages into temporary files under one directory.
pub struct TempDirStaging {
    dir: PathBuf,
}

impl TempDirStaging {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl Staging for TempDirStaging {
    fn stage_file(&self, content: &mut dyn Read) -> io::Result<StagedFile> {
        let mut file = tempfile::Builder::new()
            .prefix("staged-")
            .tempfile_in(&self.dir)?;

        let len = io::copy(content, &mut file)?;
        file.as_file().sync_all()?;

        Ok(StagedFile {
            path: file.into_temp_path(),
            len,
        })
    }
}
