use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::derivatives::batch::DEFAULT_REFRESH_INTERVAL;
use crate::derivatives::DerivativeOptions;
use crate::sanitize::ArchiveLimits;
use crate::secrets::{expand_home, SecretSource};
use crate::transport::{RetryPolicy, TransportOptions, DEFAULT_CHUNK_SIZE};
use crate::trigger::{TriggerPolicy, DEFAULT_ATTEMPTS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// SQLite file; defaults to `~/.racepix/data/racepix.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub limits: ArchiveLimits,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub derivatives: DerivativesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(expand_home(path))),
            None => crate::db::default_database_path(),
        }
    }
}

/// Exactly one of `base_url` (HTTP object API) or `local_root` (directory)
/// must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub local_root: Option<String>,
    /// Base of public URLs for the filesystem backend.
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default = "default_archive_bucket")]
    pub archive_bucket: String,
    #[serde(default = "default_originals_bucket")]
    pub originals_bucket: String,
    #[serde(default = "default_public_bucket")]
    pub public_bucket: String,
    /// tus endpoint for archive uploads. Without it archives go up in one request.
    #[serde(default)]
    pub resumable_endpoint: Option<String>,
    #[serde(default)]
    pub credential: SecretSource,
}

fn default_archive_bucket() -> String {
    "event-archives".to_string()
}

fn default_originals_bucket() -> String {
    "event-photos-originals".to_string()
}

fn default_public_bucket() -> String {
    "event-photos".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// Delay before each attempt of one request, in milliseconds.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_ms: Vec<u64>,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_retry_delays() -> Vec<u64> {
    RetryPolicy::default()
        .delays
        .iter()
        .map(|d| d.as_millis() as u64)
        .collect()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            retry_delays_ms: default_retry_delays(),
        }
    }
}

impl TransportConfig {
    pub fn options(&self) -> TransportOptions {
        TransportOptions {
            chunk_size: self.chunk_size_bytes,
            retry: RetryPolicy {
                delays: self
                    .retry_delays_ms
                    .iter()
                    .copied()
                    .map(Duration::from_millis)
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub url: String,
    #[serde(default)]
    pub credential: SecretSource,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl WorkerConfig {
    pub fn policy(&self) -> TriggerPolicy {
        TriggerPolicy {
            attempts: self.attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivativesConfig {
    #[serde(default = "default_thumbnail_edge")]
    pub thumbnail_edge: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Image stamped onto public copies. None publishes them unmarked.
    #[serde(default)]
    pub watermark_path: Option<String>,
}

fn default_thumbnail_edge() -> u32 {
    DerivativeOptions::default().thumbnail_edge
}

fn default_jpeg_quality() -> u8 {
    DerivativeOptions::default().jpeg_quality
}

fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL.as_secs()
}

impl Default for DerivativesConfig {
    fn default() -> Self {
        Self {
            thumbnail_edge: default_thumbnail_edge(),
            jpeg_quality: default_jpeg_quality(),
            refresh_interval_secs: default_refresh_interval_secs(),
            watermark_path: None,
        }
    }
}

impl DerivativesConfig {
    pub fn options(&self) -> DerivativeOptions {
        DerivativeOptions {
            thumbnail_edge: self.thumbnail_edge,
            jpeg_quality: self.jpeg_quality,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// One JSON object per line instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}
