//! A mock encoder appliance for integration testing.
//!
//! Binds to port 0 (random) and exposes the bound address; each test spins
//! up its own isolated instance and scripts its fixture: channel lists,
//! publisher statuses and names (in either wire shape), recorders, system
//! payloads, preview bytes, forced failure statuses.
//!
//! All successful responses wrap their payload in the device's
//! `{ "result": … }` envelope.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde_json::{json, Value};

/// Scriptable device state.  Mutate through [`MockDeviceServer::fixture`].
#[derive(Debug, Default)]
pub struct DeviceFixture {
    /// Payload for `GET /channels` (the `result` value).
    pub channels: Value,
    /// Per-channel publisher status payloads.
    pub publisher_status: HashMap<u32, Value>,
    /// Per-(channel, publisher) name payloads; absent entries 404.
    pub publisher_names: HashMap<(u32, String), Value>,
    /// `None` means the device has no recorder endpoint (404).
    pub recorders: Option<Value>,
    pub identity: Value,
    pub system_status: Value,
    /// `None` means preview 404s.
    pub preview: Option<Vec<u8>>,
    /// Force this HTTP status on every API endpoint.
    pub fail_with: Option<u16>,
    /// Require these HTTP Basic credentials; mismatches get 401.
    pub require_auth: Option<(String, String)>,
    /// Request counts per path, for loop/pool assertions.
    pub hits: HashMap<String, u64>,
    /// Control endpoints invoked, in order, as `"<path>"`.
    pub control_log: Vec<String>,
}

impl DeviceFixture {
    pub fn hit_count(&self, path: &str) -> u64 {
        self.hits.get(path).copied().unwrap_or(0)
    }
}

type Shared = Arc<Mutex<DeviceFixture>>;

/// Handle to a running mock device.  Dropping it aborts the server task.
pub struct MockDeviceServer {
    addr: SocketAddr,
    state: Shared,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for MockDeviceServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockDeviceServer {
    /// Start with an empty fixture on a random port.
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(DeviceFixture::default()).await
    }

    pub async fn start_with(fixture: DeviceFixture) -> std::io::Result<Self> {
        let state: Shared = Arc::new(Mutex::new(fixture));
        let router = Router::new()
            .route("/api/v2.0/channels", get(get_channels))
            .route(
                "/api/v2.0/channels/{c}/publishers/status",
                get(get_publisher_status),
            )
            .route(
                "/api/v2.0/channels/{c}/publishers/{p}/name",
                get(get_publisher_name),
            )
            .route(
                "/api/v2.0/channels/{c}/publishers/{p}/control/{action}",
                post(post_control),
            )
            .route("/api/v2.0/recorders/status", get(get_recorders))
            .route(
                "/api/v2.0/recorders/{r}/control/{action}",
                post(post_recorder_control),
            )
            .route("/api/v2.0/system/ident", get(get_identity))
            .route("/api/v2.0/system/status", get(get_system_status))
            .route("/api/v2.0/channels/{c}/preview", get(get_preview))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(MockDeviceServer { addr, state, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `"127.0.0.1:port"`, suitable as a device address.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Lock the fixture for scripting or assertions.
    pub fn fixture(&self) -> MutexGuard<'_, DeviceFixture> {
        self.state.lock().expect("fixture lock poisoned")
    }

    /// Convenience: a fixture describing one channel with one rtmp publisher.
    pub fn single_publisher_fixture(publisher_state: &str) -> DeviceFixture {
        DeviceFixture {
            channels: json!([{"id": 1, "name": "Main", "publishers": [{"id": "rtmp1", "type": "rtmp"}]}]),
            publisher_status: HashMap::from([(
                1,
                json!([{"id": "rtmp1", "type": "rtmp",
                        "status": {"state": publisher_state,
                                   "started": publisher_state == "started",
                                   "is_configured": true}}]),
            )]),
            publisher_names: HashMap::from([((1, "rtmp1".to_owned()), json!("Main RTMP"))]),
            recorders: Some(json!([{"id": "1", "name": "Recorder 1", "state": "stopped",
                                     "duration": 0, "active": 0, "total": 3, "multisource": false}])),
            identity: json!({"name": "encoder-a", "location": "rack 4", "description": ""}),
            system_status: json!({"date": "2026-02-01T12:00:00", "uptime": 86400,
                                   "cpuload": 21.5, "cpuload_high": false,
                                   "cputemp": 54.0, "cputemp_threshold": 95.0}),
            preview: Some(vec![0xFF, 0xD8, 0xFF, 0xE0]),
            ..DeviceFixture::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Auth + failure injection + hit accounting common to every endpoint.
/// Returns an error response to short-circuit with, or None to proceed.
fn gate(state: &Shared, headers: &HeaderMap, path: &str) -> Option<Response> {
    let mut fixture = state.lock().expect("fixture lock poisoned");
    *fixture.hits.entry(path.to_owned()).or_insert(0) += 1;

    if let Some(status) = fixture.fail_with {
        return Some(
            StatusCode::from_u16(status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                .into_response(),
        );
    }
    if let Some((user, secret)) = &fixture.require_auth {
        let expected = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{secret}"))
        );
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != expected {
            return Some(StatusCode::UNAUTHORIZED.into_response());
        }
    }
    None
}

fn enveloped(result: Value) -> Response {
    Json(json!({ "result": result })).into_response()
}

async fn get_channels(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Some(resp) = gate(&state, &headers, "channels") {
        return resp;
    }
    let channels = state.lock().expect("fixture lock poisoned").channels.clone();
    enveloped(channels)
}

async fn get_publisher_status(
    State(state): State<Shared>,
    Path(c): Path<u32>,
    headers: HeaderMap,
) -> Response {
    if let Some(resp) = gate(&state, &headers, &format!("channels/{c}/publishers/status")) {
        return resp;
    }
    let payload = state
        .lock()
        .expect("fixture lock poisoned")
        .publisher_status
        .get(&c)
        .cloned();
    match payload {
        Some(v) => enveloped(v),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_publisher_name(
    State(state): State<Shared>,
    Path((c, p)): Path<(u32, String)>,
    headers: HeaderMap,
) -> Response {
    if let Some(resp) = gate(&state, &headers, &format!("channels/{c}/publishers/{p}/name")) {
        return resp;
    }
    let payload = state
        .lock()
        .expect("fixture lock poisoned")
        .publisher_names
        .get(&(c, p))
        .cloned();
    match payload {
        Some(v) => enveloped(v),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_control(
    State(state): State<Shared>,
    Path((c, p, action)): Path<(u32, String, String)>,
    headers: HeaderMap,
) -> Response {
    let path = format!("channels/{c}/publishers/{p}/control/{action}");
    if let Some(resp) = gate(&state, &headers, &path) {
        return resp;
    }
    state
        .lock()
        .expect("fixture lock poisoned")
        .control_log
        .push(path);
    Json(json!({ "status": "ok" })).into_response()
}

async fn post_recorder_control(
    State(state): State<Shared>,
    Path((r, action)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let path = format!("recorders/{r}/control/{action}");
    if let Some(resp) = gate(&state, &headers, &path) {
        return resp;
    }
    state
        .lock()
        .expect("fixture lock poisoned")
        .control_log
        .push(path);
    Json(json!({ "status": "ok" })).into_response()
}

async fn get_recorders(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Some(resp) = gate(&state, &headers, "recorders/status") {
        return resp;
    }
    let payload = state.lock().expect("fixture lock poisoned").recorders.clone();
    match payload {
        Some(v) => enveloped(v),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_identity(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Some(resp) = gate(&state, &headers, "system/ident") {
        return resp;
    }
    let payload = state.lock().expect("fixture lock poisoned").identity.clone();
    enveloped(payload)
}

async fn get_system_status(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Some(resp) = gate(&state, &headers, "system/status") {
        return resp;
    }
    let payload = state
        .lock()
        .expect("fixture lock poisoned")
        .system_status
        .clone();
    enveloped(payload)
}

async fn get_preview(
    State(state): State<Shared>,
    Path(c): Path<u32>,
    headers: HeaderMap,
) -> Response {
    if let Some(resp) = gate(&state, &headers, &format!("channels/{c}/preview")) {
        return resp;
    }
    let payload = state.lock().expect("fixture lock poisoned").preview.clone();
    match payload {
        Some(bytes) => ([("content-type", "image/jpeg")], bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
