//! Preview service configuration.
//!
//! TOML only; default path `/etc/avfleet/preview.toml`.  A minimal config
//! needs `database.url` and `cache.dir`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct PreviewConfig {
    pub database_url: String,
    pub bind: String,
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub backoff: BackoffConfig,
    /// Device roster reload cadence.
    pub roster_refresh: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Files older than this are swept.
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Cadence of each target's polling loop; also the backoff base.
    pub refresh: Duration,
    pub http_timeout: Duration,
    pub resolution: String,
    pub keep_aspect_ratio: bool,
    pub format: String,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub multiplier: f64,
    pub max: Duration,
}

impl PreviewConfig {
    pub fn backoff_policy(&self) -> af_device::BackoffPolicy {
        // Threshold 1: the first failure already delays by the refresh rate.
        af_device::BackoffPolicy::new(self.fetch.refresh, self.backoff.multiplier, self.backoff.max, 1)
    }

    pub fn preview_params(&self) -> af_device::PreviewParams {
        af_device::PreviewParams {
            resolution: self.fetch.resolution.clone(),
            keep_aspect_ratio: self.fetch.keep_aspect_ratio,
            format: self.fetch.format.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    database: Option<RawDatabase>,
    bind: Option<String>,
    cache: Option<RawCache>,
    fetch: Option<RawFetch>,
    backoff: Option<RawBackoff>,
    roster_refresh_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCache {
    dir: Option<String>,
    max_age_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFetch {
    refresh_secs: Option<u64>,
    http_timeout_secs: Option<u64>,
    resolution: Option<String>,
    keep_aspect_ratio: Option<bool>,
    format: Option<String>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RawBackoff {
    multiplier: Option<f64>,
    max_secs: Option<u64>,
}

pub fn load_config_from_path(path: &Path) -> Result<PreviewConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<PreviewConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/avfleet/preview.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<PreviewConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let database_url = raw
        .database
        .and_then(|d| d.url)
        .ok_or_else(|| ConfigError::MissingField("database.url".to_owned()))?;
    let cache = raw
        .cache
        .ok_or_else(|| ConfigError::MissingField("cache".to_owned()))?;
    let dir = cache
        .dir
        .ok_or_else(|| ConfigError::MissingField("cache.dir".to_owned()))?;

    let fetch = raw.fetch.unwrap_or(RawFetch {
        refresh_secs: None,
        http_timeout_secs: None,
        resolution: None,
        keep_aspect_ratio: None,
        format: None,
        jpeg_quality: None,
    });
    let backoff = raw.backoff.unwrap_or(RawBackoff {
        multiplier: None,
        max_secs: None,
    });

    let jpeg_quality = fetch.jpeg_quality.unwrap_or(85);
    if !(1..=100).contains(&jpeg_quality) {
        return Err(ConfigError::InvalidValue(
            "fetch.jpeg_quality must be in 1..=100".to_owned(),
        ));
    }
    let multiplier = backoff.multiplier.unwrap_or(2.0);
    if multiplier < 1.0 {
        return Err(ConfigError::InvalidValue(
            "backoff.multiplier must be >= 1".to_owned(),
        ));
    }

    Ok(PreviewConfig {
        database_url,
        bind: raw.bind.unwrap_or_else(|| "127.0.0.1:9320".to_owned()),
        cache: CacheConfig {
            dir: PathBuf::from(dir),
            max_age: Duration::from_secs(cache.max_age_secs.unwrap_or(180)),
            sweep_interval: Duration::from_secs(cache.sweep_interval_secs.unwrap_or(60)),
        },
        fetch: FetchConfig {
            refresh: Duration::from_secs(fetch.refresh_secs.unwrap_or(3)),
            http_timeout: Duration::from_secs(fetch.http_timeout_secs.unwrap_or(10)),
            resolution: fetch.resolution.unwrap_or_else(|| "640x360".to_owned()),
            keep_aspect_ratio: fetch.keep_aspect_ratio.unwrap_or(true),
            format: fetch.format.unwrap_or_else(|| "jpg".to_owned()),
            jpeg_quality,
        },
        backoff: BackoffConfig {
            multiplier,
            max: Duration::from_secs(backoff.max_secs.unwrap_or(300)),
        },
        roster_refresh: Duration::from_secs(raw.roster_refresh_secs.unwrap_or(300)),
    })
}
