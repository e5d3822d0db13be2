//! Admin surface on its own bind: health, status and counters.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let (key_count, event_count) = {
        let log = state.log.lock().expect("event log lock poisoned");
        (log.key_count(), log.event_count())
    };
    Json(json!({
        "connections": state.metrics.connections_current.load(Ordering::Relaxed),
        "subscriptions": state.registry.subscription_count(),
        "fanout_channels": state.registry.channel_count(),
        "log_keys": key_count,
        "log_events": event_count,
        "events_ingested": state.metrics.events_ingested.load(Ordering::Relaxed),
        "events_deduplicated": state.metrics.events_deduplicated.load(Ordering::Relaxed),
        "events_rejected": state.metrics.events_rejected.load(Ordering::Relaxed),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let m = &state.metrics;
    let body = format!(
        "hub_connections_current {}\n\
         hub_connections_rejected {}\n\
         hub_subscriptions_current {}\n\
         hub_events_ingested {}\n\
         hub_events_deduplicated {}\n\
         hub_events_rejected {}\n\
         hub_frames_sent {}\n\
         hub_frames_dropped {}\n",
        m.connections_current.load(Ordering::Relaxed),
        m.connections_rejected.load(Ordering::Relaxed),
        state.registry.subscription_count(),
        m.events_ingested.load(Ordering::Relaxed),
        m.events_deduplicated.load(Ordering::Relaxed),
        m.events_rejected.load(Ordering::Relaxed),
        m.frames_sent.load(Ordering::Relaxed),
        m.frames_dropped.load(Ordering::Relaxed),
    );
    ([("content-type", "text/plain; version=0.0.4")], body)
}
