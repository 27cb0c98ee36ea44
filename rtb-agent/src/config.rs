//! Configuration management for the backup agent.
//!
//! Loads configuration from a TOML file. Every field has a default so a
//! partial file (or none at all) is enough to run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::{AgentError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub state_cache: StateCacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub surface_area: SurfaceAreaConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique agent identifier
    #[serde(default = "default_agent_id")]
    pub id: String,

    /// Working directory for batch files and staged copies
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Timing and sizing of the backup pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long the intake stage collects paths before taking one shared snapshot
    #[serde(default = "default_snapshot_sharing_window_ms")]
    pub snapshot_sharing_window_ms: u64,

    /// Re-check interval while files are still open for writing
    #[serde(default = "default_open_file_handle_polling_interval_ms")]
    pub open_file_handle_polling_interval_ms: u64,

    /// After this long a file still open for writing moves to long polling
    #[serde(default = "default_maximum_time_to_wait_for_no_open_file_handles_ms")]
    pub maximum_time_to_wait_for_no_open_file_handles_ms: u64,

    /// Upper bound on the interval between long-polling cycles
    #[serde(default = "default_long_polling_interval_ms")]
    pub long_polling_interval_ms: u64,

    /// Files are uploaded regardless once they have long-polled this long
    #[serde(default = "default_maximum_long_polling_time_ms")]
    pub maximum_long_polling_time_ms: u64,

    /// Files up to this size (bytes) are copied to staging so their snapshot can be released
    #[serde(default = "default_maximum_file_size_for_staging_copy")]
    pub maximum_file_size_for_staging_copy: u64,

    /// Number of upload workers
    #[serde(default = "default_upload_thread_count")]
    pub upload_thread_count: usize,

    /// How long shutdown waits for the backup-action stage before cancelling it
    #[serde(default = "default_backup_queue_drain_grace_ms")]
    pub backup_queue_drain_grace_ms: u64,

    /// Rescans pause when this many files are waiting on open handles
    #[serde(default = "default_queue_high_water_mark")]
    pub queue_high_water_mark: usize,

    /// Paused rescans resume below this many files
    #[serde(default = "default_queue_low_water_mark")]
    pub queue_low_water_mark: usize,

    /// Watch the surface area mounts for live change notifications.
    /// Without a notification backend in the binary this only affects the
    /// startup message; rescans run either way.
    #[serde(default = "default_true")]
    pub enable_file_access_notify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCacheConfig {
    /// The current batch rolls over once it reaches this many bytes
    #[serde(default = "default_maximum_batch_size")]
    pub maximum_batch_size: u64,

    /// How often a dirty current batch is uploaded
    #[serde(default = "default_batch_upload_interval_ms")]
    pub batch_upload_interval_ms: u64,

    /// Closed batches beyond this count are consolidated
    #[serde(default = "default_maximum_live_batches")]
    pub maximum_live_batches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the remote object store
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotProviderKind {
    /// ZFS snapshots of a single dataset
    Zfs,
    /// No snapshots: read the live filesystem
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_provider")]
    pub provider: SnapshotProviderKind,

    /// ZFS dataset to snapshot (e.g. `rpool/ROOT/ubuntu`)
    #[serde(default)]
    pub dataset: String,

    /// Where the dataset is mounted
    #[serde(default = "default_snapshot_mount_point")]
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceAreaConfig {
    /// Directory trees under backup
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Entries whose file name contains any of these are skipped
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Seconds between periodic rescans (0 disables)
    #[serde(default = "default_periodic_rescan_interval_secs")]
    pub periodic_rescan_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Errors are also appended here when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log_file: Option<PathBuf>,
}

// Default values
fn default_agent_id() -> String {
    "rtb-agent-01".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/rtb-agent")
}

fn default_snapshot_sharing_window_ms() -> u64 {
    5_000
}

fn default_open_file_handle_polling_interval_ms() -> u64 {
    1_000
}

fn default_maximum_time_to_wait_for_no_open_file_handles_ms() -> u64 {
    30_000
}

fn default_long_polling_interval_ms() -> u64 {
    30_000
}

fn default_maximum_long_polling_time_ms() -> u64 {
    10 * 60 * 1000
}

fn default_maximum_file_size_for_staging_copy() -> u64 {
    500 * 1024 * 1024 // 500MB
}

fn default_upload_thread_count() -> usize {
    4
}

fn default_backup_queue_drain_grace_ms() -> u64 {
    3_000
}

fn default_queue_high_water_mark() -> usize {
    10_000
}

fn default_queue_low_water_mark() -> usize {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_maximum_batch_size() -> u64 {
    1024 * 1024 // 1MB
}

fn default_batch_upload_interval_ms() -> u64 {
    30_000
}

fn default_maximum_live_batches() -> usize {
    16
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/rtb-agent/remote")
}

fn default_snapshot_provider() -> SnapshotProviderKind {
    SnapshotProviderKind::Live
}

fn default_snapshot_mount_point() -> PathBuf {
    PathBuf::from("/")
}

fn default_exclude_patterns() -> Vec<String> {
    vec![".git".to_string(), "node_modules".to_string()]
}

fn default_periodic_rescan_interval_secs() -> u64 {
    6 * 60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            snapshot_sharing_window_ms: default_snapshot_sharing_window_ms(),
            open_file_handle_polling_interval_ms: default_open_file_handle_polling_interval_ms(),
            maximum_time_to_wait_for_no_open_file_handles_ms:
                default_maximum_time_to_wait_for_no_open_file_handles_ms(),
            long_polling_interval_ms: default_long_polling_interval_ms(),
            maximum_long_polling_time_ms: default_maximum_long_polling_time_ms(),
            maximum_file_size_for_staging_copy: default_maximum_file_size_for_staging_copy(),
            upload_thread_count: default_upload_thread_count(),
            backup_queue_drain_grace_ms: default_backup_queue_drain_grace_ms(),
            queue_high_water_mark: default_queue_high_water_mark(),
            queue_low_water_mark: default_queue_low_water_mark(),
            enable_file_access_notify: true,
        }
    }
}

impl PipelineConfig {
    pub fn snapshot_sharing_window(&self) -> Duration {
        Duration::from_millis(self.snapshot_sharing_window_ms)
    }

    pub fn open_file_handle_polling_interval(&self) -> Duration {
        Duration::from_millis(self.open_file_handle_polling_interval_ms)
    }

    pub fn maximum_time_to_wait_for_no_open_file_handles(&self) -> Duration {
        Duration::from_millis(self.maximum_time_to_wait_for_no_open_file_handles_ms)
    }

    pub fn long_polling_interval(&self) -> Duration {
        Duration::from_millis(self.long_polling_interval_ms)
    }

    pub fn maximum_long_polling_time(&self) -> Duration {
        Duration::from_millis(self.maximum_long_polling_time_ms)
    }

    pub fn backup_queue_drain_grace(&self) -> Duration {
        Duration::from_millis(self.backup_queue_drain_grace_ms)
    }
}

impl Default for StateCacheConfig {
    fn default() -> Self {
        Self {
            maximum_batch_size: default_maximum_batch_size(),
            batch_upload_interval_ms: default_batch_upload_interval_ms(),
            maximum_live_batches: default_maximum_live_batches(),
        }
    }
}

impl StateCacheConfig {
    pub fn batch_upload_interval(&self) -> Duration {
        Duration::from_millis(self.batch_upload_interval_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            provider: default_snapshot_provider(),
            dataset: String::new(),
            mount_point: default_snapshot_mount_point(),
        }
    }
}

impl Default for SurfaceAreaConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            periodic_rescan_interval_secs: default_periodic_rescan_interval_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            error_log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration, e.g. as a baseline config file.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Directory holding the local copies of state cache batches
    pub fn state_dir(&self) -> PathBuf {
        self.agent.data_dir.join("state")
    }

    /// Directory holding staged copies of small files
    pub fn staging_dir(&self) -> PathBuf {
        self.agent.data_dir.join("staging")
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline.upload_thread_count == 0 {
            return Err(AgentError::Config(
                "pipeline.upload_thread_count must be at least 1".to_string(),
            ));
        }
        if self.pipeline.queue_low_water_mark > self.pipeline.queue_high_water_mark {
            return Err(AgentError::Config(
                "pipeline.queue_low_water_mark must not exceed queue_high_water_mark".to_string(),
            ));
        }
        if self.snapshot.provider == SnapshotProviderKind::Zfs && self.snapshot.dataset.is_empty()
        {
            return Err(AgentError::Config(
                "snapshot.dataset is required for the zfs provider".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_uses_defaults() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[pipeline]\nupload_thread_count = 8\n\n[surface_area]\nroots = [\"/home\"]")?;

        let config = Config::from_file(file.path())?;

        assert_eq!(config.pipeline.upload_thread_count, 8);
        assert_eq!(config.pipeline.snapshot_sharing_window(), Duration::from_secs(5));
        assert_eq!(config.surface_area.roots, vec![PathBuf::from("/home")]);
        assert_eq!(config.snapshot.provider, SnapshotProviderKind::Live);
        Ok(())
    }

    #[test]
    fn test_written_config_reloads() -> Result<()> {
        let mut config = Config::default();
        config.state_cache.maximum_live_batches = 3;

        let mut file = NamedTempFile::new()?;
        file.write_all(config.to_toml_string()?.as_bytes())?;

        let reloaded = Config::from_file(file.path())?;
        assert_eq!(reloaded.state_cache.maximum_live_batches, 3);
        Ok(())
    }

    #[test]
    fn test_rejects_zero_upload_workers() -> std::io::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[pipeline]\nupload_thread_count = 0")?;

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        Ok(())
    }

    #[test]
    fn test_zfs_requires_dataset() -> std::io::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[snapshot]\nprovider = \"zfs\"")?;

        assert!(Config::from_file(file.path()).is_err());
        Ok(())
    }
}
