//! Utility modules for the backup agent.

pub mod errors;
pub mod logger;
pub mod sync;

pub use errors::{AgentError, Result};
