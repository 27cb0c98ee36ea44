//! Content checksums used for dedup and for recorded file states.

use std::io::{self, Read};

/// Computes a fixed-width hex digest of a stream.
pub trait Checksum: Send + Sync {
    fn compute_checksum(&self, content: &mut dyn Read) -> io::Result<String>;
}

/// BLAKE3 digest, 64 lowercase hex characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Checksum;

impl Checksum for Blake3Checksum {
    fn compute_checksum(&self, content: &mut dyn Read) -> io::Result<String> {
        let mut hasher = blake3::Hasher::new();
        io::copy(content, &mut hasher)?;
        Ok(hasher.finalize().to_hex().to_string())
    }
}
