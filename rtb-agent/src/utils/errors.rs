//! Custom error types for the backup agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The state cache was asked to act on a path it never knew about.
    #[error("Consistency error: the remote file state cache has no entry for '{path}'")]
    Consistency { path: String },

    #[error("Format error: {0}")]
    Format(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl AgentError {
    /// Consistency faults mean the monitor missed or reordered an event.
    pub fn is_consistency_fault(&self) -> bool {
        matches!(self, AgentError::Consistency { .. })
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
