//! Logging configuration using tracing.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Initialize logging with the specified level.
///
/// When `error_log` is given, everything at `ERROR` is additionally appended to
/// that file. Consistency faults are reported there.
pub fn init(level: &str, error_log: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let error_layer = match error_log {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::ERROR),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .with(error_layer)
        .init();

    Ok(())
}
