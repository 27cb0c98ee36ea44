//! Local filesystem collaborators: checksums, staging, open handles, traversal.

pub mod checksum;
pub mod compare;
pub mod open_handles;
pub mod staging;
pub mod walker;
