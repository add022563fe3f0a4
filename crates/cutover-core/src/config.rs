//! cutover.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CutoverConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub stream: StreamConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8443 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/cutover"),
        }
    }
}

impl StorageConfig {
    /// Path of the redb database file inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("cutover.redb")
    }
}

/// Live-tail streaming parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Seconds between keep-alives on an idle event stream.
    pub keepalive_secs: u64,
    /// Buffered wake-ups per subscriber before it is considered lagged.
    pub notify_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 30,
            notify_capacity: 1024,
        }
    }
}

impl StreamConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Milliseconds between work-queue polls when the queue is empty.
    pub poll_interval_ms: u64,
    /// Deployments allowed to run at once.
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_concurrent: 16,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl CutoverConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: CutoverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.keepalive_secs == 0 {
            return Err(ConfigError::Invalid(
                "stream.keepalive_secs must be greater than zero".to_string(),
            ));
        }
        if self.stream.notify_capacity == 0 {
            return Err(ConfigError::Invalid(
                "stream.notify_capacity must be greater than zero".to_string(),
            ));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.worker.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_concurrent must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
