//! Daemon configuration types

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Repository used when neither `-R` nor a project config names one
pub const DEFAULT_REPOSITORY: &str = "file://.keepsake";

/// Project config file names, newest first
pub const CONFIG_FILE_NAMES: [&str; 2] = ["keepsake.yaml", "replicate.yaml"];

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Repository URL; `None` means discover it from the project directory
    #[serde(default)]
    pub repository: Option<String>,

    /// Project directory that source and artifact paths are relative to
    #[serde(default)]
    pub project_dir: PathBuf,

    /// Heartbeat settings
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,
}

impl DaemonConfig {
    /// Repository URL after applying the project config and default
    pub fn resolve_repository(&self) -> Result<String> {
        if let Some(url) = &self.repository {
            return Ok(url.clone());
        }
        match ProjectConfig::discover(&self.project_dir)? {
            Some(ProjectConfig {
                repository: Some(url),
            }) => Ok(url),
            _ => Ok(DEFAULT_REPOSITORY.to_string()),
        }
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often a running experiment refreshes its heartbeat
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Number of missed refreshes before an experiment counts as stopped
    pub miss_tolerance: u32,
}

impl HeartbeatConfig {
    /// Age after which a heartbeat is stale
    pub fn staleness_threshold(&self) -> Duration {
        self.refresh_interval * self.miss_tolerance
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            miss_tolerance: 3,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Maximum concurrent file transfers per repository
    pub transfer_concurrency: usize,

    /// Maximum concurrent metadata reads while listing
    pub list_concurrency: usize,

    /// Retry configuration for object stores
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            transfer_concurrency: 16,
            list_concurrency: 32,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts
    pub max_retries: u32,

    /// Initial delay before first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Socket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// How long shutdown waits for in-flight requests
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Client-side deadline for the socket to become connectable
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Maximum encoded message size in bytes
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            max_frame_length: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// The subset of `keepsake.yaml` the daemon reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default, alias = "storage")]
    pub repository: Option<String>,
}

impl ProjectConfig {
    /// Load the project config in `dir`, if there is one
    pub fn discover(dir: &Path) -> Result<Option<Self>> {
        for name in CONFIG_FILE_NAMES {
            let path = dir.join(name);
            let contents = match std::fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            debug!(path = %path.display(), "Loading project config");
            if contents.trim().is_empty() {
                return Ok(Some(ProjectConfig::default()));
            }
            let config = serde_yaml::from_str(&contents).map_err(|e| {
                Error::RepositoryConfiguration {
                    message: format!("failed to parse {}: {}", path.display(), e),
                }
            })?;
            return Ok(Some(config));
        }
        Ok(None)
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
