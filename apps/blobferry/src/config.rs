//! Command configuration.
//!
//! Configuration is read from TOML, found at (first match wins):
//! - the `--config` path
//! - `$XDG_CONFIG_HOME/blobferry/config.toml`
//! - `~/.config/blobferry/config.toml`
//!
//! `BLOBFERRY_*` environment variables override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use blobferry_backends::HttpTimeouts;
use blobferry_transfer::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_ATTEMPTS, DEFAULT_WORKERS, DigestAlgorithm, RetryPolicy,
    TransferOptions, VerifyMode,
};
use serde::{Deserialize, Serialize};

/// Transfer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Container URL objects are read from, optionally with a signed query.
    #[serde(default)]
    pub source_url: Option<String>,

    /// Root directory of the destination object store.
    #[serde(default)]
    pub dest_dir: Option<PathBuf>,

    /// Concurrent workers per phase.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Chunk and part size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default)]
    pub digest: DigestAlgorithm,

    #[serde(default)]
    pub verify: VerifyMode,

    /// Directory for the staging file (system temp dir if unset).
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Source connection timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Longest wait for data on an open source connection, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Per-chunk and per-part retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_url: None,
            dest_dir: None,
            workers: default_workers(),
            chunk_size: default_chunk_size(),
            digest: DigestAlgorithm::default(),
            verify: VerifyMode::default(),
            staging_dir: None,
            connect_timeout_secs: default_timeout_secs(),
            read_timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or from the default location.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Config::default()),
            },
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Applies `BLOBFERRY_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("BLOBFERRY_SOURCE_URL") {
            self.source_url = Some(url);
        }
        if let Some(dir) = lookup("BLOBFERRY_DEST_DIR") {
            self.dest_dir = Some(PathBuf::from(dir));
        }
        if let Some(workers) = lookup("BLOBFERRY_WORKERS") {
            self.workers = workers
                .trim()
                .parse()
                .with_context(|| format!("BLOBFERRY_WORKERS: invalid number {workers:?}"))?;
        }
        if let Some(size) = lookup("BLOBFERRY_CHUNK_SIZE") {
            self.chunk_size = size
                .trim()
                .parse()
                .with_context(|| format!("BLOBFERRY_CHUNK_SIZE: invalid number {size:?}"))?;
        }
        if let Some(attempts) = lookup("BLOBFERRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = attempts
                .trim()
                .parse()
                .with_context(|| format!("BLOBFERRY_MAX_ATTEMPTS: invalid number {attempts:?}"))?;
        }
        if let Some(secs) = lookup("BLOBFERRY_READ_TIMEOUT_SECS") {
            self.read_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("BLOBFERRY_READ_TIMEOUT_SECS: invalid number {secs:?}"))?;
        }
        Ok(())
    }

    /// Engine options for these settings.
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            workers: self.workers,
            chunk_size: self.chunk_size,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                backoff_factor: self.retry.backoff_factor,
            },
            digest: self.digest,
            verify: self.verify,
            staging_dir: self.staging_dir.clone(),
        }
    }

    /// Transport timeouts for the source client.
    pub fn http_timeouts(&self) -> HttpTimeouts {
        HttpTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            read: Duration::from_secs(self.read_timeout_secs),
        }
    }
}

/// Returns the default configuration file path, if a home can be found.
fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("blobferry").join("config.toml"))
}
