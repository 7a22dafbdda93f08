//! YAML configuration for the proxy.
//!
//! Loaded once at startup; request-path code only reads the parsed values.
//! Bucket key patterns are validated (compiled) during [`Config::load`] so
//! a bad regex fails the process before it serves traffic.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors surfaced at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("bucket '{bucket}': invalid key pattern '{pattern}': {source}")]
    InvalidKeyPattern {
        bucket: String,
        pattern: String,
        source: regex::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Header-rewrite rules applied to GET/HEAD responses; the first rule
    /// whose `status_codes` contains the response status wins.
    #[serde(default)]
    pub headers: Vec<HeaderRule>,
    #[serde(default)]
    pub buckets: HashMap<String, BucketConfig>,
}

/// Server knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the HTTP server.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of requests processed concurrently; the rest queue up.
    #[serde(default = "default_queue_len")]
    pub queue_len: usize,
    /// Derivative cache capacity, in entries.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Per-request deadline, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Number of image transformations allowed to run at once.
    #[serde(default = "default_transform_concurrency")]
    pub transform_concurrency: usize,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            queue_len: default_queue_len(),
            cache_size: default_cache_size(),
            request_timeout: default_request_timeout(),
            transform_concurrency: default_transform_concurrency(),
        }
    }
}

/// A conditional header overlay.
///
/// `values` is ordered (BTreeMap) so repeated applications write headers in
/// a stable order.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderRule {
    pub status_codes: Vec<u16>,
    pub values: BTreeMap<String, String>,
}

impl HeaderRule {
    pub fn matches(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }
}

/// Per-bucket settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Key patterns that identify derivatives. Each pattern must contain a
    /// named capture `parent`; optional captures `width`, `height`, `crop`,
    /// `format`, `grayscale` and `rotate` become transformation steps.
    #[serde(default)]
    pub keys: Vec<KeyRule>,
    /// Verify the parent object exists while fetching a derivative.
    #[serde(default)]
    pub check_parent: bool,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyRule {
    pub path: String,
}

/// Storage backend selection for a bucket.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    Filesystem {
        root: PathBuf,
    },
    #[default]
    Memory,
    Http {
        url: String,
    },
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parses and validates configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate_key_patterns()?;
        Ok(config)
    }

    fn validate_key_patterns(&self) -> Result<(), ConfigError> {
        for (bucket, bucket_config) in &self.buckets {
            for rule in &bucket_config.keys {
                regex::Regex::new(&rule.path).map_err(|source| {
                    ConfigError::InvalidKeyPattern {
                        bucket: bucket.clone(),
                        pattern: rule.path.clone(),
                        source,
                    }
                })?;
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            headers: Vec::new(),
            buckets: HashMap::new(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_queue_len() -> usize {
    64
}

fn default_cache_size() -> usize {
    1024
}

fn default_request_timeout() -> u64 {
    60
}

fn default_transform_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get() * 2)
        .unwrap_or(8)
}
