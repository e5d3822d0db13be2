//! Error taxonomy for device I/O.
//!
//! Classification matters operationally: transient kinds feed the backoff
//! machinery, `Unauthorized` points at stale credentials, `NotFound` is
//! normal for optional endpoints, and `Parse` means firmware drift.

use std::error::Error as StdError;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("request timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("DNS resolution failed")]
    Dns,
    #[error("connection reset")]
    Reset,
    #[error("unauthorized (401): credentials rejected")]
    Unauthorized,
    #[error("not found (404)")]
    NotFound,
    #[error("device returned HTTP {0}")]
    Http(u16),
    #[error("unparseable device response: {0}")]
    Parse(String),
    #[error("device I/O failed: {0}")]
    Other(String),
}

impl DeviceError {
    /// Transient errors are eligible for backoff-driven retry; the rest
    /// indicate configuration or firmware problems retries cannot fix.
    pub fn is_transient(&self) -> bool {
        match self {
            DeviceError::Timeout
            | DeviceError::ConnectionRefused
            | DeviceError::Dns
            | DeviceError::Reset => true,
            DeviceError::Http(status) => *status >= 500,
            DeviceError::Unauthorized
            | DeviceError::NotFound
            | DeviceError::Parse(_)
            | DeviceError::Other(_) => false,
        }
    }

    /// Short stable label for logs and error events.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::Timeout => "timeout",
            DeviceError::ConnectionRefused => "connection_refused",
            DeviceError::Dns => "dns",
            DeviceError::Reset => "reset",
            DeviceError::Unauthorized => "unauthorized",
            DeviceError::NotFound => "not_found",
            DeviceError::Http(_) => "http",
            DeviceError::Parse(_) => "parse",
            DeviceError::Other(_) => "other",
        }
    }
}

impl From<reqwest::Error> for DeviceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return DeviceError::Timeout;
        }
        if let Some(status) = err.status() {
            return match status.as_u16() {
                401 => DeviceError::Unauthorized,
                404 => DeviceError::NotFound,
                code => DeviceError::Http(code),
            };
        }
        if err.is_decode() {
            return DeviceError::Parse(err.to_string());
        }
        classify_transport(&err)
    }
}

/// Walk the source chain looking for the underlying socket error.  reqwest
/// does not surface refused/reset/DNS distinctions directly.
fn classify_transport(err: &reqwest::Error) -> DeviceError {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return DeviceError::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                    return DeviceError::Reset;
                }
                std::io::ErrorKind::TimedOut => return DeviceError::Timeout,
                _ => {}
            }
        }
        let text = inner.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return DeviceError::Dns;
        }
        source = inner.source();
    }
    if err.is_connect() {
        // Connect failure with no recognizable cause; treat as refused so it
        // stays backoff-eligible.
        return DeviceError::ConnectionRefused;
    }
    DeviceError::Other(err.to_string())
}
