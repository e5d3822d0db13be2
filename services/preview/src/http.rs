//! Preview HTTP surface.
//!
//! - `POST /api/v1/previews/{device}/{channel}/subscribe`
//! - `DELETE /api/v1/subscriptions/{subscriber_id}`
//! - `GET /api/v1/previews/{device}/{channel}/image.jpg` — cached frame or
//!   placeholder, never an error
//! - `GET /health`, `GET /status`

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::service::{PreviewError, PreviewService};

pub fn build_router(service: Arc<PreviewService>) -> Router {
    Router::new()
        .route(
            "/api/v1/previews/{device}/{channel}/subscribe",
            post(subscribe),
        )
        .route("/api/v1/subscriptions/{subscriber_id}", delete(unsubscribe))
        .route("/api/v1/previews/{device}/{channel}/image.jpg", get(image))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(service)
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeBody {
    client_hint: Option<String>,
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

async fn subscribe(
    State(service): State<Arc<PreviewService>>,
    Path((device, channel)): Path<(i64, u32)>,
    body: axum::body::Bytes,
) -> Response {
    // The body is optional; `{"client_hint": …}` when present.
    let hint = serde_json::from_slice::<SubscribeBody>(&body)
        .ok()
        .and_then(|b| b.client_hint);
    match service.subscribe(device, channel, hint) {
        Ok(receipt) => (StatusCode::CREATED, Json(receipt)).into_response(),
        Err(e @ PreviewError::UnknownDevice(_)) => not_found(e.to_string()),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn unsubscribe(
    State(service): State<Arc<PreviewService>>,
    Path(subscriber_id): Path<Uuid>,
) -> Response {
    match service.unsubscribe(subscriber_id) {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e @ PreviewError::UnknownSubscriber(_)) => not_found(e.to_string()),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn image(
    State(service): State<Arc<PreviewService>>,
    Path((device, channel)): Path<(i64, u32)>,
) -> Response {
    let (bytes, placeholder) = service.get_image(device, channel).await;
    (
        [
            ("content-type", "image/jpeg".to_owned()),
            ("x-preview-placeholder", placeholder.to_string()),
        ],
        bytes,
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn metrics(State(service): State<Arc<PreviewService>>) -> impl IntoResponse {
    let counters = &service.counters;
    let body = format!(
        "preview_loops_live {}\n\
         preview_loops_started {}\n\
         preview_fetches_ok {}\n\
         preview_fetches_failed {}\n",
        service.live_loop_count(),
        counters.started.load(Ordering::Relaxed),
        counters.fetches_ok.load(Ordering::Relaxed),
        counters.fetches_failed.load(Ordering::Relaxed),
    );
    ([("content-type", "text/plain; version=0.0.4")], body)
}

async fn status(State(service): State<Arc<PreviewService>>) -> impl IntoResponse {
    let targets: Vec<_> = service
        .live_targets()
        .into_iter()
        .map(|((device_id, channel), subscribers)| {
            json!({
                "device_id": device_id,
                "channel": channel,
                "subscribers": subscribers,
            })
        })
        .collect();
    Json(json!({
        "targets": targets,
        "live_loops": service.live_loop_count(),
        "loops_started": service.counters.started.load(Ordering::Relaxed),
        "fetches_ok": service.counters.fetches_ok.load(Ordering::Relaxed),
        "fetches_failed": service.counters.fetches_failed.load(Ordering::Relaxed),
    }))
}
