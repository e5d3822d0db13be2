//! Hub configuration loading.
//!
//! TOML is the sole config source.  Default path: `/etc/avfleet/hub.toml`.
//! A minimal config needs `database.url` and `auth.signing_secret`; every
//! cap has a sensible default.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub database_url: String,
    /// Client-facing WebSocket + query API bind.
    pub public_bind: String,
    /// Private ingestion bind (poller-facing).
    pub internal_bind: String,
    pub admin_bind: String,
    pub auth: AuthConfig,
    pub limits: LimitConfig,
    pub events: EventLogConfig,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub signing_secret: String,
    /// Acceptable clock skew when validating `exp`/`iat`.
    pub leeway: Duration,
}

#[derive(Debug, Clone)]
pub struct LimitConfig {
    pub max_connections_per_ip: usize,
    pub max_subscriptions_per_client: usize,
    /// Per-subscription queue depth; overflow drops oldest.
    pub queue_capacity: usize,
    /// Clients must ping within this window or be reaped.
    pub ping_grace: Duration,
    pub max_message_bytes: usize,
    /// Protocol violations tolerated before disconnect.
    pub max_violations: u32,
}

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Ring capacity per subscription key.
    pub ring_capacity: usize,
    /// Catch-up TTL.
    pub ttl: Duration,
    /// Producer-side dedup window; must stay below the fast poll interval
    /// or unconditional re-emits would be suppressed.
    pub dedup_window: Duration,
    /// Cadence of the expiry sweep (memory + DB mirror).
    pub sweep_interval: Duration,
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
    bind: Option<RawBind>,
    auth: Option<RawAuth>,
    limits: Option<RawLimits>,
    events: Option<RawEvents>,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBind {
    public: Option<String>,
    internal: Option<String>,
    admin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuth {
    signing_secret: Option<String>,
    leeway_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    max_connections_per_ip: Option<usize>,
    max_subscriptions_per_client: Option<usize>,
    queue_capacity: Option<usize>,
    ping_grace_secs: Option<u64>,
    max_message_bytes: Option<usize>,
    max_violations: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawEvents {
    ring_capacity: Option<usize>,
    ttl_secs: Option<u64>,
    dedup_window_ms: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

pub fn load_config_from_path(path: &Path) -> Result<HubConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<HubConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/avfleet/hub.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<HubConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let database_url = raw
        .database
        .and_then(|d| d.url)
        .ok_or_else(|| ConfigError::MissingField("database.url".to_owned()))?;

    let auth = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let signing_secret = auth
        .signing_secret
        .ok_or_else(|| ConfigError::MissingField("auth.signing_secret".to_owned()))?;
    if signing_secret.len() < 16 {
        return Err(ConfigError::InvalidValue(
            "auth.signing_secret must be at least 16 bytes".to_owned(),
        ));
    }

    let bind = raw.bind.unwrap_or(RawBind {
        public: None,
        internal: None,
        admin: None,
    });
    let limits = raw.limits.unwrap_or(RawLimits {
        max_connections_per_ip: None,
        max_subscriptions_per_client: None,
        queue_capacity: None,
        ping_grace_secs: None,
        max_message_bytes: None,
        max_violations: None,
    });
    let events = raw.events.unwrap_or(RawEvents {
        ring_capacity: None,
        ttl_secs: None,
        dedup_window_ms: None,
        sweep_interval_secs: None,
    });

    Ok(HubConfig {
        database_url,
        public_bind: bind.public.unwrap_or_else(|| "0.0.0.0:9310".to_owned()),
        internal_bind: bind.internal.unwrap_or_else(|| "127.0.0.1:9300".to_owned()),
        admin_bind: bind.admin.unwrap_or_else(|| "127.0.0.1:9311".to_owned()),
        auth: AuthConfig {
            signing_secret,
            leeway: Duration::from_secs(auth.leeway_secs.unwrap_or(30)),
        },
        limits: LimitConfig {
            max_connections_per_ip: limits.max_connections_per_ip.unwrap_or(25),
            max_subscriptions_per_client: limits.max_subscriptions_per_client.unwrap_or(50),
            queue_capacity: limits.queue_capacity.unwrap_or(100),
            ping_grace: Duration::from_secs(limits.ping_grace_secs.unwrap_or(60)),
            max_message_bytes: limits.max_message_bytes.unwrap_or(64 * 1024),
            max_violations: limits.max_violations.unwrap_or(3),
        },
        events: EventLogConfig {
            ring_capacity: events.ring_capacity.unwrap_or(100),
            ttl: Duration::from_secs(events.ttl_secs.unwrap_or(30)),
            dedup_window: Duration::from_millis(events.dedup_window_ms.unwrap_or(500)),
            sweep_interval: Duration::from_secs(events.sweep_interval_secs.unwrap_or(10)),
        },
    })
}
