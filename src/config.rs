use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

/// Default number of optional auxiliary artifacts accepted per job.
pub const DEFAULT_MAX_AUXILIARY: usize = 5;

/// Persisted host settings written by the `setup` command.
///
/// Jobs are only admitted once every field has been filled in:
/// - `hostname` and `port` are used to tell requesters how to copy a job
///   directory that was too large to deliver
/// - `mount_location` is the root under which job working directories live
/// - `max_archive_mb` bounds the size of the delivered zip
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub hostname: Option<String>,
    pub mount_location: Option<PathBuf>,
    /// SSH port of the compute host, `0` when no port should be passed.
    pub port: Option<u16>,
    pub max_archive_mb: Option<u64>,
}

impl HostConfig {
    pub fn new(
        hostname: impl Into<String>,
        mount_location: impl Into<PathBuf>,
        port: u16,
        max_archive_mb: u64,
    ) -> Self {
        Self {
            hostname: Some(hostname.into()),
            mount_location: Some(mount_location.into()),
            port: Some(port),
            max_archive_mb: Some(max_archive_mb),
        }
    }

    /// Check that setup has been completed with all required values.
    pub fn is_complete(&self) -> bool {
        self.hostname.as_deref().is_some_and(|h| !h.is_empty())
            && self.mount_location.is_some()
            && self.port.is_some()
            && self.max_archive_mb.is_some_and(|mb| mb > 0)
    }

    /// Maximum delivered archive size in bytes.
    pub fn max_archive_bytes(&self) -> Option<u64> {
        self.max_archive_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    pub fn mount_root(&self) -> PathBuf {
        self.mount_location
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("stagehand"))
    }

    /// Load from a JSON file. A missing file yields an empty (incomplete) config.
    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(path, std::fs::read_to_string(path))
    }

    /// Same as [`HostConfig::load`] without blocking the runtime.
    pub async fn read(path: &Path) -> Result<Self> {
        Self::parse(path, tokio::fs::read_to_string(path).await)
    }

    fn parse(path: &Path, raw: std::io::Result<String>) -> Result<Self> {
        match raw {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(RunnerError::Config(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Configuration for launching the external compute program.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Path to the executable. It receives the staged input file as its only argument.
    pub program: PathBuf,
    /// Kill the process after this long. `None` runs until the process exits.
    pub timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/Orca/orca"),
            timeout: None,
        }
    }
}

/// Configuration for the output relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    /// Larger chunks are split into several updates.
    pub max_update_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_update_bytes: 1900,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub host: HostConfig,
    pub executor: ExecutorConfig,
    pub relay: RelayConfig,
    pub max_auxiliary: usize,
    /// Evict the oldest finished jobs from the archive past this many entries.
    pub archive_capacity: Option<usize>,
    /// Local paths submitted over HTTP must resolve inside this directory.
    /// Without it only URLs are accepted.
    pub upload_root: Option<PathBuf>,
    /// Settings file re-read before each admission so `setup` applies to a
    /// running server.
    pub host_file: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            executor: ExecutorConfig::default(),
            relay: RelayConfig::default(),
            max_auxiliary: DEFAULT_MAX_AUXILIARY,
            archive_capacity: None,
            upload_root: None,
            host_file: None,
        }
    }
}

impl RunnerConfig {
    pub fn new(host: HostConfig) -> Self {
        Self {
            host,
            ..Default::default()
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.executor.program = program.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.relay.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.executor.timeout = Some(timeout);
        self
    }

    pub fn with_archive_capacity(mut self, capacity: usize) -> Self {
        self.archive_capacity = Some(capacity);
        self
    }

    pub fn with_upload_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.upload_root = Some(root.into());
        self
    }

    pub fn with_host_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_file = Some(path.into());
        self
    }

    /// Root directory for job working directories.
    pub fn mount_root(&self) -> PathBuf {
        self.host.mount_root()
    }
}
