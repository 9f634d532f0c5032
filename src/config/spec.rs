//! Engine settings types.
//!
//! This module defines the structs that map to the `halldyll.converge.yaml`
//! file. Every field has a default, so an empty file is a valid
//! configuration using the local backend.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default base directory of the local backend.
pub const DEFAULT_STATE_DIR: &str = ".halldyll";

/// The root settings structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// State backend configuration.
    pub state: StateConfig,
    /// Lock timings.
    pub lock: LockConfig,
    /// Executor tuning.
    pub execution: ExecutionConfig,
    /// Diff engine behavior.
    pub diff: DiffConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateConfig {
    /// Backend type.
    pub backend: StateBackend,
    /// State-store key: one snapshot and one lock per key.
    pub key: String,
    /// Base directory for the local backend.
    pub path: PathBuf,
    /// S3 bucket name (required for s3 backend).
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
    /// Process-local storage, lost on exit.
    Memory,
}

/// Lock timings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Lease duration in seconds.
    pub lease_secs: u64,
    /// How long to wait for a held lock before giving up.
    pub acquire_timeout_secs: u64,
    /// Polling interval while waiting, in milliseconds.
    pub retry_interval_ms: u64,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum provider calls in flight within a batch.
    pub parallelism: usize,
    /// Attempts per action, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on the retry delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Timeout of one provider call, in seconds.
    pub action_timeout_secs: u64,
    /// Apply-level deadline in seconds; no new batch starts after it.
    pub apply_deadline_secs: Option<u64>,
}

/// Diff engine behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiffConfig {
    /// Whether and how stored records are checked against providers.
    pub read_through: ReadThrough,
}

/// Read-through mode of the diff engine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadThrough {
    /// Trust stored records.
    #[default]
    Disabled,
    /// Check that stored identifiers still resolve.
    Verify,
    /// Compare against live attributes instead of stored ones.
    Refresh,
}

/// Log output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            key: String::from("default"),
            path: PathBuf::from(DEFAULT_STATE_DIR),
            bucket: None,
            prefix: None,
            region: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_secs: 300,
            acquire_timeout_secs: 60,
            retry_interval_ms: 2000,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            action_timeout_secs: 600,
            apply_deadline_secs: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: LogFormat::default(),
        }
    }
}

impl LockConfig {
    /// Lease duration.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl ExecutionConfig {
    /// Timeout of one provider call.
    #[must_use]
    pub const fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    /// Apply-level deadline, if any.
    #[must_use]
    pub fn apply_deadline(&self) -> Option<Duration> {
        self.apply_deadline_secs.map(Duration::from_secs)
    }
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Memory => "memory",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for StateBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "memory" => Ok(Self::Memory),
            other => Err(format!("Invalid state backend: {other}. Expected: local, s3, or memory")),
        }
    }
}

impl std::fmt::Display for ReadThrough {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Verify => "verify",
            Self::Refresh => "refresh",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.state.key, "default");
        assert_eq!(config.lock.lease(), Duration::from_secs(300));
        assert_eq!(config.execution.parallelism, 10);
        assert_eq!(config.execution.apply_deadline(), None);
        assert_eq!(config.diff.read_through, ReadThrough::Disabled);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("S3".parse::<StateBackend>(), Ok(StateBackend::S3));
        assert_eq!("memory".parse::<StateBackend>(), Ok(StateBackend::Memory));
        assert!("etcd".parse::<StateBackend>().is_err());
    }
}
