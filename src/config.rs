//! Configuration for storage, builds, distribution and device sync
//!
//! Every section has serde defaults so a partial TOML file (or none at all)
//! yields a working configuration. Binaries layer CLI/env overrides on top.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{BundlecastError, Result};

/// 1 MiB
pub const DEFAULT_CHUNK_THRESHOLD: usize = 1024 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default)]
    pub sync: SyncPolicy,
}

/// Default data directory (`$XDG_DATA_HOME/bundlecast` or platform equivalent)
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(shellexpand::tilde("~/.local/share").to_string()))
        .join("bundlecast")
}

impl AppConfig {
    /// Load from `path` if given, otherwise defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Load from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(raw).map_err(|e| BundlecastError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.build.chunk_threshold_bytes == 0 {
            return Err(BundlecastError::Config(
                "build.chunk_threshold_bytes must be positive".to_string(),
            ));
        }
        if self.build.upload_concurrency == 0 {
            return Err(BundlecastError::Config(
                "build.upload_concurrency must be positive".to_string(),
            ));
        }
        if self.build.compression_level > 9 {
            return Err(BundlecastError::Config(
                "build.compression_level must be between 0 and 9".to_string(),
            ));
        }
        if self.distribution.signing_secret.len() < 16 {
            return Err(BundlecastError::Config(
                "distribution.signing_secret must be at least 16 bytes".to_string(),
            ));
        }
        if self.sync.fetch_concurrency == 0 || self.sync.worker_concurrency == 0 {
            return Err(BundlecastError::Config(
                "sync concurrency limits must be positive".to_string(),
            ));
        }
        if self.sync.fetch_attempts == 0 {
            return Err(BundlecastError::Config(
                "sync.fetch_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// SQLite storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Busy timeout in milliseconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_db_path() -> String {
    data_dir().join("bundlecast.db").to_string_lossy().to_string()
}

fn default_busy_timeout() -> u64 {
    30_000
}

/// Bundle builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Uncompressed size threshold for one chunk
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold_bytes: usize,
    /// gzip level (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// Maximum chunk uploads in flight for one build
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Attempts per chunk upload before the build fails
    #[serde(default = "default_attempts")]
    pub upload_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Lifetime of a READY bundle (0 = never expires)
    #[serde(default = "default_bundle_ttl")]
    pub bundle_ttl_days: i64,
    /// GENERATING bundles older than this are abandoned by `reclaim`
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    /// How long a coalesced build request waits for the in-flight one
    #[serde(default = "default_build_timeout")]
    pub coalesce_wait_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            chunk_threshold_bytes: default_chunk_threshold(),
            compression_level: default_compression_level(),
            upload_concurrency: default_upload_concurrency(),
            upload_attempts: default_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            bundle_ttl_days: default_bundle_ttl(),
            build_timeout_secs: default_build_timeout(),
            coalesce_wait_secs: default_build_timeout(),
        }
    }
}

fn default_chunk_threshold() -> usize {
    DEFAULT_CHUNK_THRESHOLD
}

fn default_compression_level() -> u32 {
    6
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    200
}

fn default_bundle_ttl() -> i64 {
    90
}

fn default_build_timeout() -> u64 {
    600
}

/// Distribution layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    /// Public base URL of the delivery boundary
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// HMAC key for signed URLs
    #[serde(default = "default_signing_secret")]
    pub signing_secret: String,
    /// `max-age` for chunk responses
    #[serde(default = "default_chunk_max_age")]
    pub chunk_max_age_secs: u64,
    /// `max-age` for manifest responses
    #[serde(default = "default_manifest_max_age")]
    pub manifest_max_age_secs: u64,
    /// Default lifetime of signed URLs
    #[serde(default = "default_url_ttl")]
    pub signed_url_ttl_secs: u64,
    /// Purge endpoint of the edge cache (used with the `cdn` feature)
    pub purge_endpoint: Option<String>,
    pub purge_token: Option<String>,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            signing_secret: default_signing_secret(),
            chunk_max_age_secs: default_chunk_max_age(),
            manifest_max_age_secs: default_manifest_max_age(),
            signed_url_ttl_secs: default_url_ttl(),
            purge_endpoint: None,
            purge_token: None,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_signing_secret() -> String {
    "change-me-bundlecast-signing-key".to_string()
}

fn default_chunk_max_age() -> u64 {
    31_536_000
}

fn default_manifest_max_age() -> u64 {
    60
}

fn default_url_ttl() -> u64 {
    3600
}

/// Device sync policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// How often devices should report their cache
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,
    /// Jobs larger than this are deferred while the device is on cellular
    #[serde(default = "default_cellular_max_bytes")]
    pub cellular_max_bytes: u64,
    /// Attempts per chunk fetch (checksum mismatches count as failures)
    #[serde(default = "default_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Chunk downloads in flight for one job
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Jobs executed concurrently by the sync worker
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Poll interval of the sync worker for PENDING jobs
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// RUNNING jobs older than this are failed by maintenance
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    #[serde(default)]
    pub feature_flags: BTreeMap<String, bool>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            max_cache_bytes: default_max_cache_bytes(),
            cellular_max_bytes: default_cellular_max_bytes(),
            fetch_attempts: default_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            fetch_concurrency: default_fetch_concurrency(),
            worker_concurrency: default_worker_concurrency(),
            poll_interval_ms: default_poll_interval(),
            job_timeout_secs: default_job_timeout(),
            feature_flags: BTreeMap::new(),
        }
    }
}

fn default_sync_interval() -> u64 {
    900
}

fn default_max_cache_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_cellular_max_bytes() -> u64 {
    25 * 1024 * 1024
}

fn default_fetch_concurrency() -> usize {
    8
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_job_timeout() -> u64 {
    900
}
