// archiver-config - Unified configuration for the event archiver
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority, ARCHIVER_* then legacy raw names)
// 2. Config file path from ARCHIVER_CONFIG env var
// 3. Config file contents from ARCHIVER_CONFIG_CONTENT env var
// 4. Default config file locations (./config.toml, ./.archiver.toml)
// 5. Built-in defaults (lowest priority)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod env_overrides;
mod sources;
mod validation;

pub use env_overrides::{EnvSource, ENV_PREFIX};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub request: RequestConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
}

/// Buffering and flush-trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Elapsed time since the last successful flush that fires the time trigger.
    #[serde(default = "default_flush_every_ms")]
    pub flush_every_ms: u64,
    /// Buffered record count that fires the size trigger.
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
    /// How often the time trigger checks elapsed time.
    #[serde(default = "default_flush_check_interval_ms")]
    pub flush_check_interval_ms: u64,
    /// Upper bound on the final flush during shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub partition_mode: PartitionMode,
}

fn default_flush_every_ms() -> u64 {
    5_000
}

fn default_max_buffer() -> usize {
    500
}

fn default_flush_check_interval_ms() -> u64 {
    1_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl ArchiveConfig {
    pub fn flush_every(&self) -> Duration {
        Duration::from_millis(self.flush_every_ms)
    }

    pub fn flush_check_interval(&self) -> Duration {
        Duration::from_millis(self.flush_check_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            flush_every_ms: default_flush_every_ms(),
            max_buffer: default_max_buffer(),
            flush_check_interval_ms: default_flush_check_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            partition_mode: PartitionMode::default(),
        }
    }
}

/// How a flushed batch is mapped onto object keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionMode {
    /// One object per flush, filed under the first record's tenant/date/hour.
    #[default]
    FirstRecord,
    /// One object per (tenant, date, hour) group present in the flush.
    Split,
}

impl std::fmt::Display for PartitionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionMode::FirstRecord => write!(f, "first-record"),
            PartitionMode::Split => write!(f, "split"),
        }
    }
}

impl std::str::FromStr for PartitionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "first-record" | "first_record" | "first" => Ok(PartitionMode::FirstRecord),
            "split" | "per-partition" => Ok(PartitionMode::Split),
            _ => anyhow::bail!(
                "Unsupported partition mode: {}. Supported: first-record, split",
                s
            ),
        }
    }
}

/// Broker subscription configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub topic: String,
    pub group_id: String,
    /// Partition count for the in-process topic.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

fn default_partitions() -> u32 {
    1
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: "events_raw".to_string(),
            group_id: "archiver".to_string(),
            partitions: default_partitions(),
        }
    }
}

/// Request handling configuration for the publish endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    pub max_payload_bytes: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            fs: None,
            s3: Some(S3Config::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StorageBackend::Fs),
            "s3" | "aws" | "minio" => Ok(StorageBackend::S3),
            _ => anyhow::bail!("Unsupported storage backend: {}. Supported: fs, s3", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            path: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    /// Optional path prefix for all archived objects (e.g., "archive/")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "analytics-archive".to_string(),
            region: "us-east-1".to_string(),
            endpoint: Some("http://localhost:9002".to_string()),
            access_key_id: Some("minio".to_string()),
            secret_access_key: Some("minio_password".to_string()),
            prefix: None,
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load configuration from a specific file path (for CLI usage).
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Load configuration with graceful fallback to defaults.
    /// Does not fail if config file is missing.
    pub fn load_or_default() -> Result<Self> {
        sources::load_or_default()
    }

    /// Construct a config that contains only built-in defaults (no env or files).
    pub fn from_defaults() -> Self {
        RuntimeConfig {
            server: Some(ServerConfig::default()),
            ..RuntimeConfig::default()
        }
    }

    /// Merge another config into this one (used for TOML layering).
    pub fn merge(&mut self, other: RuntimeConfig) {
        self.archive = other.archive;
        self.broker = other.broker;
        self.request = other.request;
        self.storage = other.storage;

        if other.server.is_some() {
            self.server = other.server;
        }
    }

    /// Apply environment overrides from a custom source.
    pub fn apply_env_overrides_from<E: EnvSource>(&mut self, env: &E) -> Result<()> {
        env_overrides::apply_env_overrides(self, env)
    }

    /// Build a configuration from defaults, optional inline TOML and an `EnvSource`.
    pub fn load_with_env<E: EnvSource>(inline_config: Option<&str>, env: &E) -> Result<Self> {
        let mut config = RuntimeConfig::from_defaults();

        if let Some(inline) = inline_config {
            let file_config: RuntimeConfig =
                toml::from_str(inline).context("Failed to parse inline config content")?;
            config.merge(file_config);
        }

        config.apply_env_overrides_from(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}
