// af-protocol: Fleet event model and wire-format types.
//
// All client-facing WebSocket messages use a top-level `type` field for
// discriminated deserialization and camelCase member names.  These shapes
// are frozen; dashboard clients parse them directly.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// The seven kinds of telemetry carried on the bus.
///
/// `DeviceHealth` is a pure liveness signal (`{device_id, status, last_seen}`);
/// channel counts travel exclusively on `DeviceChannels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DeviceHealth,
    PublisherStatus,
    PublisherNames,
    RecorderStatus,
    DeviceChannels,
    SystemIdentity,
    SystemStatus,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::DeviceHealth => "device_health",
            EventType::PublisherStatus => "publisher_status",
            EventType::PublisherNames => "publisher_names",
            EventType::RecorderStatus => "recorder_status",
            EventType::DeviceChannels => "device_channels",
            EventType::SystemIdentity => "system_identity",
            EventType::SystemStatus => "system_status",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "device_health" => Ok(EventType::DeviceHealth),
            "publisher_status" => Ok(EventType::PublisherStatus),
            "publisher_names" => Ok(EventType::PublisherNames),
            "recorder_status" => Ok(EventType::RecorderStatus),
            "device_channels" => Ok(EventType::DeviceChannels),
            "system_identity" => Ok(EventType::SystemIdentity),
            "system_status" => Ok(EventType::SystemStatus),
            other => Err(KeyError::UnknownType(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription keys
// ---------------------------------------------------------------------------

/// Errors from parsing or validating a subscription key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    UnknownType(String),
    InvalidDevice(String),
    InvalidChannel(String),
    Empty,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::UnknownType(t) => write!(f, "unknown data type '{t}'"),
            KeyError::InvalidDevice(d) => write!(f, "device '{d}' is not a valid IPv4 address"),
            KeyError::InvalidChannel(c) => write!(f, "channel '{c}' is not a positive integer"),
            KeyError::Empty => write!(f, "empty subscription key"),
        }
    }
}

impl std::error::Error for KeyError {}

/// Strict dotted-quad IPv4 check: exactly four decimal octets in 0..=255,
/// no leading/trailing garbage.  Device addresses on the wire must pass this.
pub fn is_strict_ipv4(s: &str) -> bool {
    let mut octets = 0u8;
    for part in s.split('.') {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        // Reject leading zeros ("01") which some parsers read as octal.
        if part.len() > 1 && part.starts_with('0') {
            return false;
        }
        let Ok(v) = part.parse::<u16>() else {
            return false;
        };
        if v > 255 {
            return false;
        }
        octets += 1;
        if octets > 4 {
            return false;
        }
    }
    octets == 4
}

/// The canonical fan-out routing key: `<type>:<device>[:<channel>[:<publisher>]]`.
///
/// The `device` component is the appliance's IPv4 address as known to the
/// roster.  A publisher component requires a channel component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub event_type: EventType,
    pub device: String,
    pub channel: Option<u32>,
    pub publisher: Option<String>,
}

impl SubscriptionKey {
    pub fn new(
        event_type: EventType,
        device: impl Into<String>,
        channel: Option<u32>,
        publisher: Option<String>,
    ) -> Result<Self, KeyError> {
        let device = device.into();
        if !is_strict_ipv4(&device) {
            return Err(KeyError::InvalidDevice(device));
        }
        if let Some(0) = channel {
            return Err(KeyError::InvalidChannel("0".to_owned()));
        }
        // A publisher without a channel has no place in the key grammar.
        let publisher = if channel.is_some() { publisher } else { None };
        Ok(SubscriptionKey {
            event_type,
            device,
            channel,
            publisher,
        })
    }

    /// Parse the display form.  Publishers may contain further `:` characters;
    /// everything after the third separator belongs to the publisher id.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        let mut parts = s.splitn(4, ':');
        let event_type: EventType = parts.next().ok_or(KeyError::Empty)?.parse()?;
        let device = parts.next().ok_or(KeyError::Empty)?.to_owned();
        let channel = match parts.next() {
            Some(c) => Some(
                c.parse::<u32>()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| KeyError::InvalidChannel(c.to_owned()))?,
            ),
            None => None,
        };
        let publisher = parts.next().map(str::to_owned);
        Self::new(event_type, device, channel, publisher)
    }

    /// Keys a delivery for this target must also reach, most specific first:
    /// the key itself, then each ancestor prefix.  A subscriber at device
    /// granularity observes channel- and publisher-level truth.
    pub fn self_and_ancestors(&self) -> Vec<SubscriptionKey> {
        let mut keys = vec![self.clone()];
        if self.publisher.is_some() {
            keys.push(SubscriptionKey {
                publisher: None,
                ..self.clone()
            });
        }
        if self.channel.is_some() {
            keys.push(SubscriptionKey {
                channel: None,
                publisher: None,
                ..self.clone()
            });
        }
        keys
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.event_type, self.device)?;
        if let Some(c) = self.channel {
            write!(f, ":{c}")?;
            if let Some(p) = &self.publisher {
                write!(f, ":{p}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for SubscriptionKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Change hashes
// ---------------------------------------------------------------------------

/// Serialize `value` with object keys in lexicographic order at every level.
/// Arrays keep their order; scalars serialize as serde_json renders them.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[*k], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Content digest used for producer-side deduplication: 32 lowercase hex
/// characters over the canonical JSON of
/// `{type, device, channel?, publisher?, data}`.
///
/// Deterministic: equal inputs (regardless of object key order inside
/// `data`) produce equal hashes.
pub fn change_hash(
    event_type: EventType,
    device: &str,
    channel: Option<u32>,
    publisher: Option<&str>,
    data: &serde_json::Value,
) -> String {
    let mut envelope = serde_json::Map::new();
    envelope.insert("type".to_owned(), event_type.as_str().into());
    envelope.insert("device".to_owned(), device.into());
    if let Some(c) = channel {
        envelope.insert("channel".to_owned(), c.into());
    }
    if let Some(p) = publisher {
        envelope.insert("publisher".to_owned(), p.into());
    }
    envelope.insert("data".to_owned(), data.clone());
    let canonical = canonical_json(&serde_json::Value::Object(envelope));
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A stored event as held in the catch-up log and mirrored to
/// `realtime_events_cache`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    pub data: serde_json::Value,
    pub change_hash: String,
    pub event_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn key(&self) -> Result<SubscriptionKey, KeyError> {
        SubscriptionKey::new(
            self.event_type,
            self.device.clone(),
            self.channel,
            self.publisher.clone(),
        )
    }
}

/// Body of `POST /internal/v1/events` (poller -> hub).
///
/// `change_hash` is optional; the hub computes it when absent and never
/// trusts a mismatched one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Identifies the producer, e.g. "poller".
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Client WebSocket messages (dashboard <-> hub)
// ---------------------------------------------------------------------------

/// Client-to-hub messages.  Frozen camelCase wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        data_type: EventType,
        device: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publisher_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        data_type: EventType,
        device: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publisher_id: Option<String>,
    },
    Ping,
}

/// Hub-to-client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    DataUpdate {
        subscription_key: String,
        data_type: EventType,
        device: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publisher_id: Option<String>,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
        /// Always false: the transport is cache-free by design.
        cached: bool,
    },
    #[serde(rename_all = "camelCase")]
    Subscribed { subscription_key: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { subscription_key: String },
    Pong,
    Error(ErrorFrame),
}

impl ServerMessage {
    pub fn data_update(key: &SubscriptionKey, event: &Event) -> Self {
        ServerMessage::DataUpdate {
            subscription_key: key.to_string(),
            data_type: event.event_type,
            device: event.device.clone(),
            channel: event.channel,
            publisher_id: event.publisher.clone(),
            data: event.data.clone(),
            timestamp: event.event_timestamp,
            cached: false,
        }
    }
}

/// Frozen error codes for WS error frames and HTTP envelopes.
pub mod error_codes {
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const CONNECTION_LIMIT: &str = "CONNECTION_LIMIT";
    pub const SUBSCRIPTION_LIMIT: &str = "SUBSCRIPTION_LIMIT";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Protocol error frame (hub -> client).
///
/// | Code               | Retryable |
/// |--------------------|-----------|
/// | INVALID_TOKEN      | false     |
/// | PERMISSION_DENIED  | false     |
/// | CONNECTION_LIMIT   | true      |
/// | SUBSCRIPTION_LIMIT | false     |
/// | PROTOCOL_ERROR     | false     |
/// | VALIDATION_ERROR   | false     |
/// | MESSAGE_TOO_LARGE  | false     |
/// | INTERNAL_ERROR     | true      |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

// ---------------------------------------------------------------------------
// Bearer token claims
// ---------------------------------------------------------------------------

/// Claims carried in the bearer JWT presented on WS upgrade.  Minted by the
/// external identity service; the hub only verifies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Operator identity.
    pub sub: String,
    /// Permission strings; `realtime` is required to attach to the bus.
    #[serde(default)]
    pub permissions: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

/// The permission a client must hold to attach to the event bus.
pub const REALTIME_PERMISSION: &str = "realtime";

// ---------------------------------------------------------------------------
// HTTP API envelope
// ---------------------------------------------------------------------------

/// Frozen HTTP error envelope used by all non-2xx responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
