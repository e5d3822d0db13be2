//! The private ingestion surface (poller -> hub).
//!
//! `POST /internal/v1/events`: schema validation -> 400, duplicate within
//! the dedup window -> 202 discarded, accepted -> 202 after the event is
//! appended to the ring and broadcast.  The durable mirror write happens
//! off the request path; a dead database never stalls ingestion.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use af_protocol::{
    change_hash, is_strict_ipv4, Event, HttpErrorEnvelope, IngestEvent, SubscriptionKey,
};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event_log::InsertOutcome;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/internal/v1/events", post(ingest_event))
        .with_state(state)
}

fn validation_error(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(HttpErrorEnvelope {
            code: af_protocol::error_codes::VALIDATION_ERROR.to_owned(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

/// Validate an ingest body into its routing key.
pub fn validate(event: &IngestEvent) -> Result<SubscriptionKey, String> {
    if !is_strict_ipv4(&event.device) {
        return Err(format!("device '{}' is not a strict IPv4 address", event.device));
    }
    if event.publisher.is_some() && event.channel.is_none() {
        return Err("publisher requires a channel".to_owned());
    }
    if let Some(0) = event.channel {
        return Err("channel must be positive".to_owned());
    }
    if event.source.is_empty() {
        return Err("source must not be empty".to_owned());
    }
    SubscriptionKey::new(
        event.event_type,
        event.device.clone(),
        event.channel,
        event.publisher.clone(),
    )
    .map_err(|e| e.to_string())
}

async fn ingest_event(State(state): State<AppState>, body: Json<serde_json::Value>) -> Response {
    let ingest: IngestEvent = match serde_json::from_value(body.0) {
        Ok(ingest) => ingest,
        Err(e) => {
            state.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
            return validation_error(format!("malformed event: {e}"));
        }
    };

    let key = match validate(&ingest) {
        Ok(key) => key,
        Err(message) => {
            state.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
            return validation_error(message);
        }
    };

    let computed = change_hash(
        ingest.event_type,
        &ingest.device,
        ingest.channel,
        ingest.publisher.as_deref(),
        &ingest.data,
    );
    if let Some(provided) = &ingest.change_hash {
        if provided != &computed {
            state.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
            return validation_error("change_hash does not match event content");
        }
    }

    let event = Arc::new(Event {
        event_id: Uuid::new_v4(),
        event_type: ingest.event_type,
        device: ingest.device,
        channel: ingest.channel,
        publisher: ingest.publisher,
        data: ingest.data,
        change_hash: computed,
        event_timestamp: ingest.timestamp,
        created_at: Utc::now(),
    });

    // Append and broadcast under one short critical section: per-key FIFO
    // holds because no second producer can interleave between the two.
    let outcome = {
        let mut log = state.log.lock().expect("event log lock poisoned");
        let outcome = log.offer(&key.to_string(), event.clone());
        if outcome == InsertOutcome::Inserted {
            let reached = state.registry.publish(&key, &event);
            state.metrics.frames_sent.fetch_add(reached as u64, Ordering::Relaxed);
        }
        outcome
    };

    match outcome {
        InsertOutcome::Duplicate => {
            state.metrics.events_deduplicated.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "duplicate event discarded at the producer gate");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "accepted": false, "duplicate": true })),
            )
                .into_response()
        }
        InsertOutcome::Inserted => {
            state.metrics.events_ingested.fetch_add(1, Ordering::Relaxed);

            // Durable mirror, off the live path.
            let pool = state.pool.clone();
            let mirror = event.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::repo::insert_event(&pool, &mirror).await {
                    warn!(error = %e, "event mirror write failed");
                }
            });

            (
                StatusCode::ACCEPTED,
                Json(json!({ "accepted": true, "event_id": event.event_id })),
            )
                .into_response()
        }
    }
}
