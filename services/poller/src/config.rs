//! Poller configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/avfleet/poller.toml`.
//!
//! Every knob has a default; a minimal config needs only `database.url`
//! and `hub.ingest_url`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub database_url: String,
    pub hub_ingest_url: String,
    pub intervals: IntervalConfig,
    pub http: HttpConfig,
    pub backoff: BackoffConfig,
    pub reconcile_interval: Duration,
    pub admin_bind: String,
}

/// Tier cadences.
#[derive(Debug, Clone)]
pub struct IntervalConfig {
    pub fast: Duration,
    pub medium: Duration,
    pub slow: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub pool_size: usize,
    pub pool_idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub error_threshold: u32,
}

impl PollerConfig {
    pub fn transport(&self) -> af_device::TransportConfig {
        af_device::TransportConfig {
            request_timeout: self.http.timeout,
            pool_max_idle_per_host: self.http.pool_size,
            pool_idle_timeout: self.http.pool_idle_timeout,
        }
    }

    pub fn backoff_policy(&self) -> af_device::BackoffPolicy {
        af_device::BackoffPolicy::new(
            self.backoff.base,
            self.backoff.multiplier,
            self.backoff.max,
            self.backoff.error_threshold,
        )
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    database: Option<RawDatabase>,
    hub: Option<RawHub>,
    polling: Option<RawPolling>,
    http: Option<RawHttp>,
    backoff: Option<RawBackoff>,
    admin: Option<RawAdmin>,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHub {
    ingest_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPolling {
    fast_secs: Option<u64>,
    medium_secs: Option<u64>,
    slow_secs: Option<u64>,
    reconcile_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawHttp {
    timeout_secs: Option<u64>,
    pool_size: Option<usize>,
    pool_idle_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawBackoff {
    base_secs: Option<u64>,
    multiplier: Option<f64>,
    max_secs: Option<u64>,
    error_threshold: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawAdmin {
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

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

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<PollerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<PollerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/avfleet/poller.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<PollerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let database_url = raw
        .database
        .and_then(|d| d.url)
        .ok_or_else(|| ConfigError::MissingField("database.url".to_owned()))?;
    let hub_ingest_url = raw
        .hub
        .and_then(|h| h.ingest_url)
        .ok_or_else(|| ConfigError::MissingField("hub.ingest_url".to_owned()))?;

    let polling = raw.polling.unwrap_or(RawPolling {
        fast_secs: None,
        medium_secs: None,
        slow_secs: None,
        reconcile_secs: None,
    });
    let fast = polling.fast_secs.unwrap_or(1);
    let medium = polling.medium_secs.unwrap_or(15);
    let slow = polling.slow_secs.unwrap_or(30);
    if fast == 0 || medium == 0 || slow == 0 {
        return Err(ConfigError::InvalidValue(
            "polling intervals must be positive".to_owned(),
        ));
    }
    if fast > medium || medium > slow {
        return Err(ConfigError::InvalidValue(
            "polling intervals must satisfy fast <= medium <= slow".to_owned(),
        ));
    }

    let http = raw.http.unwrap_or(RawHttp {
        timeout_secs: None,
        pool_size: None,
        pool_idle_secs: None,
    });
    let backoff = raw.backoff.unwrap_or(RawBackoff {
        base_secs: None,
        multiplier: None,
        max_secs: None,
        error_threshold: None,
    });
    let multiplier = backoff.multiplier.unwrap_or(2.0);
    if multiplier < 1.0 {
        return Err(ConfigError::InvalidValue(
            "backoff.multiplier must be >= 1".to_owned(),
        ));
    }
    let error_threshold = backoff.error_threshold.unwrap_or(10);
    if error_threshold == 0 {
        return Err(ConfigError::InvalidValue(
            "backoff.error_threshold must be positive".to_owned(),
        ));
    }

    Ok(PollerConfig {
        database_url,
        hub_ingest_url,
        intervals: IntervalConfig {
            fast: Duration::from_secs(fast),
            medium: Duration::from_secs(medium),
            slow: Duration::from_secs(slow),
        },
        http: HttpConfig {
            timeout: Duration::from_secs(http.timeout_secs.unwrap_or(10)),
            pool_size: http.pool_size.unwrap_or(20),
            pool_idle_timeout: Duration::from_secs(http.pool_idle_secs.unwrap_or(30)),
        },
        backoff: BackoffConfig {
            base: Duration::from_secs(backoff.base_secs.unwrap_or(1)),
            multiplier,
            max: Duration::from_secs(backoff.max_secs.unwrap_or(60)),
            error_threshold,
        },
        reconcile_interval: Duration::from_secs(polling.reconcile_secs.unwrap_or(300)),
        admin_bind: raw
            .admin
            .and_then(|a| a.bind)
            .unwrap_or_else(|| "127.0.0.1:9301".to_owned()),
    })
}
