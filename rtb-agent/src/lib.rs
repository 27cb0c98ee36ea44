//! Real-time backup agent.
//!
//! Watches live filesystem changes, reads changed files from point-in-time
//! snapshots once their writers are done with them, and replicates them to
//! remote storage while keeping a batched log of what has been backed up.

pub mod agent;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod monitor;
pub mod scan;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use agent::{AgentCollaborators, BackupAgent, QueueSizes};
pub use config::Config;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
