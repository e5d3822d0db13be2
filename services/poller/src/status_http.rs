//! Operational HTTP surface.
//!
//! - `GET /health`                 — always 200 (process is running)
//! - `GET /status`                 — per-device tick/error/backoff state
//! - `GET /metrics`                — plain-text counters
//! - `POST /force-refresh?device=` — drop snapshots so the next tick
//!                                   re-writes and re-emits everything
//! - `POST /clear-cache?device=`   — alias for the detector snapshots
//! - `POST /control/publishers`, `POST /control/recorders` — relay start/stop
//!   commands to a device; the next fast tick picks up the transition
//!
//! No authentication: this binds to an internal admin address.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use af_device::{ControlAction, DeviceClient};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::registry::Registry;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<Registry>,
    pub client: DeviceClient,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/force-refresh", post(force_refresh))
        .route("/clear-cache", post(force_refresh))
        .route("/control/publishers", post(control_publisher))
        .route("/control/recorders", post(control_recorder))
        .with_state(state)
}

pub async fn serve(
    bind: String,
    state: AdminState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind = %bind, "admin HTTP listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|&stop| stop).await;
        })
        .await
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    let devices: Vec<_> = state
        .registry
        .all()
        .iter()
        .map(|runtime| {
            json!({
                "device_id": runtime.record.device_id,
                "address": runtime.record.address,
                "display_name": runtime.record.display_name,
                "error_count": runtime.error_count(),
                "in_backoff": runtime.in_backoff.load(Ordering::Acquire),
                "active_channels": runtime.active_channels(),
                "last_success": runtime.last_success().map(|t| t.to_rfc3339()),
            })
        })
        .collect();

    Json(json!({
        "started_at": state.started_at.to_rfc3339(),
        "devices": devices,
        "ticks_total": state.registry.ticks_total.load(Ordering::Relaxed),
        "ticks_failed": state.registry.ticks_failed.load(Ordering::Relaxed),
        "writes_applied": state.registry.writes_applied.load(Ordering::Relaxed),
        "writes_failed": state.registry.writes_failed.load(Ordering::Relaxed),
        "events_submitted": state.registry.events_submitted.load(Ordering::Relaxed),
    }))
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    let registry = &state.registry;
    let body = format!(
        "poller_devices {}\n\
         poller_ticks_total {}\n\
         poller_ticks_failed {}\n\
         poller_writes_applied {}\n\
         poller_writes_failed {}\n\
         poller_events_submitted {}\n",
        registry.all().len(),
        registry.ticks_total.load(Ordering::Relaxed),
        registry.ticks_failed.load(Ordering::Relaxed),
        registry.writes_applied.load(Ordering::Relaxed),
        registry.writes_failed.load(Ordering::Relaxed),
        registry.events_submitted.load(Ordering::Relaxed),
    );
    ([("content-type", "text/plain; version=0.0.4")], body)
}

#[derive(Debug, Deserialize)]
struct RefreshQuery {
    device: Option<String>,
}

async fn force_refresh(
    State(state): State<AdminState>,
    Query(query): Query<RefreshQuery>,
) -> impl IntoResponse {
    let refreshed = state.registry.force_refresh(query.device.as_deref());
    if refreshed == 0 && query.device.is_some() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "refreshed": 0, "error": "no such device" })),
        );
    }
    (StatusCode::OK, Json(json!({ "refreshed": refreshed })))
}

fn parse_action(action: &str) -> Option<ControlAction> {
    match action {
        "start" => Some(ControlAction::Start),
        "stop" => Some(ControlAction::Stop),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct PublisherControlBody {
    device: String,
    channel: u32,
    publisher: String,
    action: String,
}

async fn control_publisher(
    State(state): State<AdminState>,
    Json(body): Json<PublisherControlBody>,
) -> impl IntoResponse {
    let Some(action) = parse_action(&body.action) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "action must be start or stop" })),
        );
    };
    let Some(runtime) = state
        .registry
        .all()
        .into_iter()
        .find(|r| r.record.address == body.device)
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no such device" })),
        );
    };

    match state
        .client
        .control_publisher(&runtime.record.target(), body.channel, &body.publisher, action)
        .await
    {
        Ok(()) => {
            // Surface the transition immediately instead of waiting a tick.
            runtime.force_refresh();
            (StatusCode::OK, Json(json!({ "status": "ok" })))
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string(), "kind": e.kind() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct RecorderControlBody {
    device: String,
    recorder: String,
    action: String,
}

async fn control_recorder(
    State(state): State<AdminState>,
    Json(body): Json<RecorderControlBody>,
) -> impl IntoResponse {
    let Some(action) = parse_action(&body.action) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "action must be start or stop" })),
        );
    };
    let Some(runtime) = state
        .registry
        .all()
        .into_iter()
        .find(|r| r.record.address == body.device)
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no such device" })),
        );
    };

    match state
        .client
        .control_recorder(&runtime.record.target(), &body.recorder, action)
        .await
    {
        Ok(()) => {
            runtime.force_refresh();
            (StatusCode::OK, Json(json!({ "status": "ok" })))
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string(), "kind": e.kind() })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRuntime;
    use crate::roster::DeviceRecord;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn admin_state() -> AdminState {
        admin_state_for("10.0.0.2")
    }

    fn admin_state_for(address: &str) -> AdminState {
        let registry = Arc::new(Registry::new());
        registry.insert(Arc::new(DeviceRuntime::new(DeviceRecord {
            device_id: 1,
            address: address.to_owned(),
            username: "admin".to_owned(),
            secret: "s".to_owned(),
            display_name: Some("Stage".to_owned()),
        })));
        AdminState {
            registry,
            client: DeviceClient::new(&af_device::TransportConfig::default()).unwrap(),
            started_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn status_lists_devices() {
        let router = build_router(admin_state());
        let response = router
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["devices"][0]["address"], "10.0.0.2");
        assert_eq!(parsed["devices"][0]["error_count"], 0);
    }

    #[tokio::test]
    async fn force_refresh_unknown_device_is_404() {
        let router = build_router(admin_state());
        let response = router
            .oneshot(
                Request::post("/force-refresh?device=10.9.9.9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn publisher_control_relays_to_the_device() {
        let device = af_test_utils::MockDeviceServer::start_with(
            af_test_utils::MockDeviceServer::single_publisher_fixture("stopped"),
        )
        .await
        .unwrap();
        let state = admin_state_for(&device.address());
        let router = build_router(state);

        let body = serde_json::json!({
            "device": device.address(),
            "channel": 1,
            "publisher": "rtmp1",
            "action": "start",
        });
        let response = router
            .oneshot(
                Request::post("/control/publishers")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            device.fixture().control_log,
            vec!["channels/1/publishers/rtmp1/control/start".to_owned()]
        );
    }

    #[tokio::test]
    async fn recorder_control_rejects_bad_action() {
        let router = build_router(admin_state());
        let body = serde_json::json!({
            "device": "10.0.0.2",
            "recorder": "1",
            "action": "pause",
        });
        let response = router
            .oneshot(
                Request::post("/control/recorders")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn force_refresh_bumps_generation() {
        let state = admin_state();
        let registry = state.registry.clone();
        let router = build_router(state);
        let response = router
            .oneshot(
                Request::post("/force-refresh?device=10.0.0.2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let generation = registry.get(1).unwrap().refresh_gen.load(Ordering::Acquire);
        assert_eq!(generation, 1);
    }
}
