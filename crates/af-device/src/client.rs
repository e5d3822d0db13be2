//! The device HTTP client.
//!
//! # Conventions
//! - HTTP Basic auth with per-device credentials on every request.
//! - Payloads live under a `result` envelope field; the client unwraps.
//! - One shared `reqwest::Client` carries the keep-alive pool for the whole
//!   fleet; per-host socket count and idle TTL are bounded at construction.
//! - Optional endpoints (publisher name, recorders) degrade instead of
//!   failing; everything else returns a classified [`DeviceError`].

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::DeviceError;
use crate::types::{
    Channel, PublisherStatus, RawPublisherStatus, RecorderStatus, SystemIdentity, SystemStatus,
};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Transport settings for the shared pool.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Keep-alive sockets retained per device.
    pub pool_max_idle_per_host: usize,
    /// Idle socket TTL before the pool drops it.
    pub pool_idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            request_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 20,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Address and credentials for one appliance.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub address: String,
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credentials stay out of logs.
        f.debug_struct("DeviceTarget")
            .field("address", &self.address)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Start/stop verb for publisher and recorder control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
        }
    }
}

/// Query parameters for `GET …/preview`.
#[derive(Debug, Clone)]
pub struct PreviewParams {
    /// E.g. `"640x360"`.
    pub resolution: String,
    pub keep_aspect_ratio: bool,
    /// E.g. `"jpg"`.
    pub format: String,
}

impl Default for PreviewParams {
    fn default() -> Self {
        PreviewParams {
            resolution: "640x360".to_owned(),
            keep_aspect_ratio: true,
            format: "jpg".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

/// Publisher name payloads vary by firmware: a bare string or `{name: …}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NameResult {
    Plain(String),
    Object { name: String },
}

impl NameResult {
    fn into_string(self) -> String {
        match self {
            NameResult::Plain(s) | NameResult::Object { name: s } => s,
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceClient
// ---------------------------------------------------------------------------

/// Stateless typed wrapper over the device API.  Cheap to clone; all clones
/// share one connection pool.
#[derive(Clone)]
pub struct DeviceClient {
    http: reqwest::Client,
}

impl DeviceClient {
    pub fn new(transport: &TransportConfig) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .timeout(transport.request_timeout)
            .pool_max_idle_per_host(transport.pool_max_idle_per_host)
            .pool_idle_timeout(transport.pool_idle_timeout)
            .build()
            .map_err(|e| DeviceError::Other(e.to_string()))?;
        Ok(DeviceClient { http })
    }

    /// `GET /api/v2.0/channels`
    pub async fn get_channels(&self, dev: &DeviceTarget) -> Result<Vec<Channel>, DeviceError> {
        self.get_json(dev, "channels?publishers=yes").await
    }

    /// `GET /api/v2.0/channels/<c>/publishers/status`
    pub async fn get_publisher_status(
        &self,
        dev: &DeviceTarget,
        channel: u32,
    ) -> Result<Vec<PublisherStatus>, DeviceError> {
        let raw: Vec<RawPublisherStatus> = self
            .get_json(dev, &format!("channels/{channel}/publishers/status"))
            .await?;
        Ok(raw.into_iter().map(PublisherStatus::from).collect())
    }

    /// `GET /api/v2.0/channels/<c>/publishers/<p>/name`
    ///
    /// Never fails: 404, parse failures and transport errors all degrade to
    /// the synthetic `"Publisher <id>"`.
    pub async fn get_publisher_name(
        &self,
        dev: &DeviceTarget,
        channel: u32,
        publisher: &str,
    ) -> String {
        let path = format!("channels/{channel}/publishers/{publisher}/name");
        match self.get_json::<NameResult>(dev, &path).await {
            Ok(name) => {
                let name = name.into_string();
                if name.trim().is_empty() {
                    format!("Publisher {publisher}")
                } else {
                    name
                }
            }
            Err(err) => {
                debug!(device = %dev.address, channel, publisher, error = %err,
                       "publisher name unavailable, using synthetic");
                format!("Publisher {publisher}")
            }
        }
    }

    /// `GET /api/v2.0/recorders/status` — 404 means the device has no
    /// recorder support; that is an empty list, not an error.
    pub async fn get_recorder_status(
        &self,
        dev: &DeviceTarget,
    ) -> Result<Vec<RecorderStatus>, DeviceError> {
        match self.get_json(dev, "recorders/status").await {
            Ok(recorders) => Ok(recorders),
            Err(DeviceError::NotFound) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// `GET /api/v2.0/system/ident`
    pub async fn get_system_identity(
        &self,
        dev: &DeviceTarget,
    ) -> Result<SystemIdentity, DeviceError> {
        self.get_json(dev, "system/ident").await
    }

    /// `GET /api/v2.0/system/status`
    pub async fn get_system_status(&self, dev: &DeviceTarget) -> Result<SystemStatus, DeviceError> {
        self.get_json(dev, "system/status").await
    }

    /// `POST /api/v2.0/channels/<c>/publishers/<p>/control/{start|stop}`
    pub async fn control_publisher(
        &self,
        dev: &DeviceTarget,
        channel: u32,
        publisher: &str,
        action: ControlAction,
    ) -> Result<(), DeviceError> {
        let path = format!(
            "channels/{channel}/publishers/{publisher}/control/{}",
            action.as_str()
        );
        self.post_control(dev, &path).await
    }

    /// `POST /api/v2.0/recorders/<r>/control/{start|stop}`
    pub async fn control_recorder(
        &self,
        dev: &DeviceTarget,
        recorder: &str,
        action: ControlAction,
    ) -> Result<(), DeviceError> {
        let path = format!("recorders/{recorder}/control/{}", action.as_str());
        self.post_control(dev, &path).await
    }

    /// `GET /api/v2.0/channels/<c>/preview` — raw image bytes.
    pub async fn get_preview(
        &self,
        dev: &DeviceTarget,
        channel: u32,
        params: &PreviewParams,
    ) -> Result<Bytes, DeviceError> {
        let response = self
            .http
            .get(self.url(dev, &format!("channels/{channel}/preview")))
            .query(&[
                ("resolution", params.resolution.as_str()),
                (
                    "keep_aspect_ratio",
                    if params.keep_aspect_ratio { "true" } else { "false" },
                ),
                ("format", params.format.as_str()),
            ])
            .basic_auth(&dev.username, Some(&dev.secret))
            .send()
            .await?;
        let response = Self::check_status(response)?;
        Ok(response.bytes().await?)
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn url(&self, dev: &DeviceTarget, path: &str) -> String {
        format!("http://{}/api/v2.0/{path}", dev.address)
    }

    fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DeviceError> {
        match response.status().as_u16() {
            200..=299 => Ok(response),
            401 => Err(DeviceError::Unauthorized),
            404 => Err(DeviceError::NotFound),
            code => Err(DeviceError::Http(code)),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        dev: &DeviceTarget,
        path: &str,
    ) -> Result<T, DeviceError> {
        let response = self
            .http
            .get(self.url(dev, path))
            .basic_auth(&dev.username, Some(&dev.secret))
            .send()
            .await?;
        let response = Self::check_status(response)?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| DeviceError::Parse(e.to_string()))?;
        Ok(envelope.result)
    }

    async fn post_control(&self, dev: &DeviceTarget, path: &str) -> Result<(), DeviceError> {
        let response = self
            .http
            .post(self.url(dev, path))
            .basic_auth(&dev.username, Some(&dev.secret))
            .send()
            .await?;
        let response = Self::check_status(response)?;

        // Acks come back as {"status": "ok"} or {"result": …}; a 2xx with an
        // explicit non-ok status is a device-side rejection.
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DeviceError::Parse(e.to_string()))?;
        match body.get("status").and_then(serde_json::Value::as_str) {
            Some("ok") | None => Ok(()),
            Some(other) => Err(DeviceError::Other(format!(
                "control rejected with status '{other}'"
            ))),
        }
    }
}
