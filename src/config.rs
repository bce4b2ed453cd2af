use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{Product, Satellite};
use crate::error::ArchiveError;
use crate::remote::{ArchiveBackend, BucketClient, CdnClient};

/// Runtime tuning for one reconciliation session. Passed explicitly into
/// the reconciler and fetch coordinator; there is no process-wide state.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub archive_root: Utf8PathBuf,
    pub cache_root: Utf8PathBuf,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl ArchiveConfig {
    pub fn new(archive_root: Utf8PathBuf) -> Result<Self, ArchiveError> {
        Ok(Self {
            archive_root,
            cache_root: default_cache_root()?,
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

pub fn default_cache_root() -> Result<Utf8PathBuf, ArchiveError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.cache_dir().join("sat-archive")).ok())
        .ok_or_else(|| ArchiveError::CacheUnavailable("unable to resolve cache directory".to_string()))
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    200
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Remote backend description; the tag picks the capability variant once,
/// at construction time.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    Cdn { base_url: String },
    Bucket { endpoint: String, bucket: String },
}

impl RemoteConfig {
    pub fn build(&self, timeout: Duration) -> Result<ArchiveBackend, ArchiveError> {
        match self {
            RemoteConfig::Cdn { base_url } => {
                Ok(ArchiveBackend::Cdn(CdnClient::new(base_url.clone(), timeout)?))
            }
            RemoteConfig::Bucket { endpoint, bucket } => Ok(ArchiveBackend::Bucket(
                BucketClient::new(endpoint.clone(), bucket.clone(), timeout)?,
            )),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub archive_root: String,
    pub satellite: String,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub interval_minutes: u32,
    pub remote: RemoteConfig,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub cache_root: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub archive: ArchiveConfig,
    pub satellite: Satellite,
    pub products: Vec<Product>,
    pub interval_minutes: u32,
    pub remote: RemoteConfig,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ArchiveError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("sat-archive.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(ArchiveError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ArchiveError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ArchiveError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ArchiveError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let satellite: Satellite = config.satellite.parse()?;
        let products = if config.products.is_empty() {
            vec![Product::GeoColor]
        } else {
            config
                .products
                .iter()
                .map(|name| name.parse())
                .collect::<Result<Vec<Product>, ArchiveError>>()?
        };

        let cache_root = match config.cache_root {
            Some(path) => Utf8PathBuf::from(path),
            None => default_cache_root()?,
        };

        let archive = ArchiveConfig {
            archive_root: Utf8PathBuf::from(config.archive_root),
            cache_root,
            concurrency: config.concurrency.max(1),
            max_attempts: config.max_attempts.max(1),
            base_backoff_ms: config.base_backoff_ms,
            request_timeout_secs: config.request_timeout_secs,
        };

        Ok(ResolvedConfig {
            schema_version,
            archive,
            satellite,
            products,
            interval_minutes: config.interval_minutes,
            remote: config.remote,
        })
    }
}
