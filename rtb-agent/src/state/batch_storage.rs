//! Local persistence of numbered batch files.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::warn;

use crate::utils::errors::Result;

/// Append-oriented sink for the current batch.
pub trait BatchWriter: Send {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

pub trait BatchStorage: Send + Sync {
    /// Batch numbers present locally, ascending.
    fn enumerate_batches(&self) -> Result<Vec<u64>>;

    fn read_batch(&self, batch_number: u64) -> Result<Vec<u8>>;

    /// Open a batch for appending, creating it when missing.
    fn open_batch_writer(&self, batch_number: u64) -> Result<Box<dyn BatchWriter>>;

    /// Drop `retired` and atomically replace `merged_into` with `merged`.
    fn switch_to_consolidated(&self, retired: u64, merged_into: u64, merged: &[u8]) -> Result<()>;

    /// Closed batches whose final contents reached remote storage.
    fn uploaded_batches(&self) -> Result<BTreeSet<u64>>;

    fn record_uploaded_batches(&self, uploaded: &BTreeSet<u64>) -> Result<()>;
}

/// Lists the uploaded batch numbers, one per line. Not a number, so never
/// enumerated as a batch.
const UPLOADED_FILE: &str = "uploaded";

/// Batches as plain files named by their number.
pub struct LocalBatchStorage {
    dir: PathBuf,
}

impl LocalBatchStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn batch_file(&self, batch_number: u64) -> PathBuf {
        self.dir.join(batch_number.to_string())
    }

    /// Replace `target` with `bytes` through a synced temporary in the same directory.
    fn write_atomically(&self, prefix: &str, target: PathBuf, bytes: &[u8]) -> Result<()> {
        let mut temp = tempfile::Builder::new().prefix(prefix).tempfile_in(&self.dir)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(target).map_err(|e| e.error)?;
        Ok(())
    }
}

struct FileBatchWriter {
    file: File,
}

impl BatchWriter for FileBatchWriter {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

impl BatchStorage for LocalBatchStorage {
    fn enumerate_batches(&self) -> Result<Vec<u64>> {
        let mut batches = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Leftover temporaries and foreign files are ignored
            if let Some(number) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
                batches.push(number);
            }
        }
        batches.sort_unstable();
        Ok(batches)
    }

    fn read_batch(&self, batch_number: u64) -> Result<Vec<u8>> {
        Ok(fs::read(self.batch_file(batch_number))?)
    }

    fn open_batch_writer(&self, batch_number: u64) -> Result<Box<dyn BatchWriter>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.batch_file(batch_number))?;
        Ok(Box::new(FileBatchWriter { file }))
    }

    fn switch_to_consolidated(&self, retired: u64, merged_into: u64, merged: &[u8]) -> Result<()> {
        self.write_atomically(".consolidating-", self.batch_file(merged_into), merged)?;

        match fs::remove_file(self.batch_file(retired)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn uploaded_batches(&self) -> Result<BTreeSet<u64>> {
        let contents = match fs::read_to_string(self.dir.join(UPLOADED_FILE)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut uploaded = BTreeSet::new();
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.parse::<u64>() {
                Ok(number) => {
                    uploaded.insert(number);
                }
                Err(_) => warn!(line, "Ignoring malformed uploaded batch entry"),
            }
        }
        Ok(uploaded)
    }

    fn record_uploaded_batches(&self, uploaded: &BTreeSet<u64>) -> Result<()> {
        let contents: String = uploaded.iter().map(|n| format!("{}\n", n)).collect();
        self.write_atomically(".uploaded-", self.dir.join(UPLOADED_FILE), contents.as_bytes())
    }
}
