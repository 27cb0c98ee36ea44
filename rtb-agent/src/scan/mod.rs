//! Initial backup and periodic rescans of the surface area.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::BackupAgent;
use crate::config::{PipelineConfig, ScanConfig, SurfaceAreaConfig};
use crate::fs::walker::{is_within_roots, walk_roots, FileInfo, WalkOptions};
use crate::state::file_state::to_ticks;
use crate::utils::errors::Result;

const THROTTLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How many paths are handed to the agent between watermark checks.
const CHUNK_SIZE: usize = 256;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub checked: usize,
    pub unchanged: usize,
    pub removed: usize,
}

pub struct Scanner {
    agent: Arc<BackupAgent>,
    roots: Vec<PathBuf>,
    options: WalkOptions,
    high_water_mark: usize,
    low_water_mark: usize,
}

impl Scanner {
    pub fn new(
        agent: Arc<BackupAgent>,
        surface_area: &SurfaceAreaConfig,
        pipeline: &PipelineConfig,
    ) -> Self {
        Self {
            agent,
            roots: surface_area.roots.clone(),
            options: WalkOptions {
                exclude_patterns: surface_area.exclude_patterns.clone(),
            },
            high_water_mark: pipeline.queue_high_water_mark,
            low_water_mark: pipeline.queue_low_water_mark,
        }
    }

    /// Back up the whole surface area with the monitor paused, then resume it.
    pub async fn initial_backup(&self, cancel: &CancellationToken) -> Result<ScanSummary> {
        info!(roots = self.roots.len(), "Starting initial backup");
        self.agent.pause_monitor();

        let result = self.scan(false, cancel).await;
        if result.is_ok() {
            tokio::select! {
                _ = self.agent.wait_for_idle() => {}
                _ = cancel.cancelled() => {}
            }
        }

        self.agent.unpause_monitor();
        let summary = result?;
        info!(
            checked = summary.checked,
            removed = summary.removed,
            "Initial backup complete"
        );
        Ok(summary)
    }

    /// Check only files whose size or modification time differ from the cache.
    pub async fn rescan(&self, cancel: &CancellationToken) -> Result<ScanSummary> {
        let summary = self.scan(true, cancel).await?;
        info!(
            checked = summary.checked,
            unchanged = summary.unchanged,
            removed = summary.removed,
            "Rescan complete"
        );
        Ok(summary)
    }

    pub async fn run_periodic(&self, config: &ScanConfig, cancel: &CancellationToken) {
        if config.periodic_rescan_interval_secs == 0 {
            debug!("Periodic rescan disabled");
            return;
        }

        let interval = Duration::from_secs(config.periodic_rescan_interval_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }

            if let Err(e) = self.rescan(cancel).await {
                warn!(error = %e, "Periodic rescan failed");
            }
        }
        debug!("Periodic rescan stopped");
    }

    async fn scan(&self, skip_unchanged: bool, cancel: &CancellationToken) -> Result<ScanSummary> {
        let roots = self.roots.clone();
        let options = self.options.clone();
        let files = tokio::task::spawn_blocking(move || walk_roots(&roots, &options)).await??;

        let mut summary = ScanSummary::default();
        let mut seen = HashSet::with_capacity(files.len());
        let mut pending = Vec::with_capacity(CHUNK_SIZE);

        for file in files {
            let path = file.path_string();
            seen.insert(path.clone());
            if skip_unchanged && self.matches_cache(&path, &file) {
                summary.unchanged += 1;
                continue;
            }

            pending.push(path);
            if pending.len() >= CHUNK_SIZE {
                if !self.throttle(cancel).await {
                    return Ok(summary);
                }
                summary.checked += pending.len();
                self.agent.check_paths(pending.drain(..));
            }
        }
        summary.checked += pending.len();
        self.agent.check_paths(pending);

        // Tracked files that the walk no longer finds
        let vanished: Vec<String> = self
            .agent
            .cache()
            .enumerate_paths()
            .into_iter()
            .filter(|path| !seen.contains(path) && is_within_roots(Path::new(path), &self.roots))
            .collect();
        summary.removed = vanished.len();
        self.agent.check_paths(vanished);

        Ok(summary)
    }

    fn matches_cache(&self, path: &str, file: &FileInfo) -> bool {
        self.agent.cache().get_file_state(path).is_some_and(|known| {
            known.file_size == file.size
                && matches!(
                    (to_ticks(&known.last_modified_utc), to_ticks(&file.modified)),
                    (Ok(known_ticks), Ok(file_ticks)) if known_ticks == file_ticks
                )
        })
    }

    /// Past the high water mark, wait for the open files to drop below the low one.
    /// Returns false if cancelled while waiting.
    async fn throttle(&self, cancel: &CancellationToken) -> bool {
        if self.agent.open_files_count() < self.high_water_mark {
            return true;
        }

        debug!(
            open_files = self.agent.open_files_count(),
            high_water_mark = self.high_water_mark,
            "Scan throttled"
        );
        while self.agent.open_files_count() >= self.low_water_mark {
            tokio::select! {
                _ = tokio::time::sleep(THROTTLE_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return false,
            }
            if self.agent.is_stopping() {
                return false;
            }
        }
        true
    }
}
