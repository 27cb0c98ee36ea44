//! Byte-for-byte file comparison, used to judge whether a file has settled.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 64 * 1024;

/// Whether two files have identical contents.
///
/// Returns `ErrorKind::Interrupted` if `cancel` fires part way through.
pub fn files_are_equal(a: &Path, b: &Path, cancel: &CancellationToken) -> io::Result<bool> {
    let mut file_a = File::open(a)?;
    let mut file_b = File::open(b)?;

    if file_a.metadata()?.len() != file_b.metadata()?.len() {
        return Ok(false);
    }

    let mut buffer_a = vec![0u8; BUFFER_SIZE];
    let mut buffer_b = vec![0u8; BUFFER_SIZE];

    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "comparison cancelled"));
        }

        let read_a = read_full(&mut file_a, &mut buffer_a)?;
        let read_b = read_full(&mut file_b, &mut buffer_b)?;

        if read_a != read_b || buffer_a[..read_a] != buffer_b[..read_b] {
            return Ok(false);
        }

        if read_a == 0 {
            return Ok(true);
        }
    }
}

/// Fill as much of `buffer` as the reader allows; 0 only at end of file.
fn read_full(reader: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
