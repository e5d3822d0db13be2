//! Payload types reported by the device API.
//!
//! Devices wrap every payload in a `{ "result": … }` envelope; the client
//! unwraps before these types are produced.  Numeric identifiers arrive as
//! either JSON numbers or strings depending on firmware vintage, so id
//! fields deserialize tolerantly.

use serde::{Deserialize, Deserializer, Serialize};

/// Accepts `3` or `"3"`.
pub(crate) fn u32_from_number_or_string<'de, D>(de: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u32),
        Text(String),
    }
    match Raw::deserialize(de)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Accepts `"rtmp1"` or `7`.
pub(crate) fn string_from_string_or_number<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Num(i64),
    }
    Ok(match Raw::deserialize(de)? {
        Raw::Text(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// One encoding channel as reported by `GET /api/v2.0/channels`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(deserialize_with = "u32_from_number_or_string")]
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub publishers: Vec<ChannelPublisher>,
}

/// Publisher stub embedded in the channel list (identity only; live state
/// comes from the per-channel status endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPublisher {
    #[serde(deserialize_with = "string_from_string_or_number")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// Publishers
// ---------------------------------------------------------------------------

/// Publisher lifecycle state as projected from repeated polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl PublisherState {
    pub fn as_str(self) -> &'static str {
        match self {
            PublisherState::Stopped => "stopped",
            PublisherState::Starting => "starting",
            PublisherState::Started => "started",
            PublisherState::Stopping => "stopping",
        }
    }
}

/// Live publisher status, flattened from the device's nested
/// `{id, type, status: {state, started, is_configured}}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublisherStatus {
    pub id: String,
    pub kind: String,
    pub state: PublisherState,
    pub started: bool,
    pub is_configured: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawPublisherStatus {
    #[serde(deserialize_with = "string_from_string_or_number")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub status: RawPublisherStatusInner,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawPublisherStatusInner {
    pub state: PublisherState,
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub is_configured: bool,
}

impl From<RawPublisherStatus> for PublisherStatus {
    fn from(raw: RawPublisherStatus) -> Self {
        PublisherStatus {
            id: raw.id,
            kind: raw.kind.unwrap_or_default(),
            state: raw.status.state,
            started: raw.status.started,
            is_configured: raw.status.is_configured,
        }
    }
}

// ---------------------------------------------------------------------------
// Recorders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Disabled,
    Starting,
    Started,
    Stopped,
    Error,
}

impl RecorderState {
    pub fn as_str(self) -> &'static str {
        match self {
            RecorderState::Disabled => "disabled",
            RecorderState::Starting => "starting",
            RecorderState::Started => "started",
            RecorderState::Stopped => "stopped",
            RecorderState::Error => "error",
        }
    }
}

/// Device-wide recorder status from `GET /api/v2.0/recorders/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderStatus {
    #[serde(deserialize_with = "string_from_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub state: RecorderState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Seconds recorded in the active session.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub active: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub multisource: bool,
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// Rarely-changing identity from `GET /api/v2.0/system/ident`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemIdentity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
}

/// Constantly-changing health from `GET /api/v2.0/system/status`.
///
/// `date` is the device wall clock; the change detector strips it before
/// comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub cpuload: f64,
    #[serde(default)]
    pub cpuload_high: bool,
    #[serde(default)]
    pub cputemp: f64,
    #[serde(default)]
    pub cputemp_threshold: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_deserialize_from_number_or_string() {
        let a: Channel = serde_json::from_str(r#"{"id": 1, "publishers": []}"#).unwrap();
        let b: Channel = serde_json::from_str(r#"{"id": "1", "publishers": []}"#).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 1);
    }

    #[test]
    fn publisher_status_flattens_nested_shape() {
        let raw: RawPublisherStatus = serde_json::from_str(
            r#"{"id": "rtmp1", "type": "rtmp", "status": {"state": "starting", "started": false, "is_configured": true}}"#,
        )
        .unwrap();
        let status = PublisherStatus::from(raw);
        assert_eq!(status.id, "rtmp1");
        assert_eq!(status.kind, "rtmp");
        assert_eq!(status.state, PublisherState::Starting);
        assert!(!status.started);
        assert!(status.is_configured);
    }

    #[test]
    fn recorder_status_tolerates_missing_optionals() {
        let r: RecorderStatus =
            serde_json::from_str(r#"{"id": 2, "state": "stopped"}"#).unwrap();
        assert_eq!(r.id, "2");
        assert_eq!(r.state, RecorderState::Stopped);
        assert_eq!(r.duration, 0);
        assert!(!r.multisource);
    }
}
