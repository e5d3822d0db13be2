//! Read-only catch-up queries over the event log.
//!
//! Bearer-authenticated (same tokens as the WebSocket).  Served from the
//! in-memory ring; these endpoints never call back into the poller.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use af_protocol::{error_codes, is_strict_ipv4, HttpErrorEnvelope};

use crate::auth::{authorize, extract_bearer, AuthError};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/events/latest", get(latest_events))
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.to_owned(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

fn authorize_request(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer);
    let Some(token) = token else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            error_codes::INVALID_TOKEN,
            "missing bearer token",
        ));
    };
    match authorize(&state.config.auth, token) {
        Ok(_) => Ok(()),
        Err(AuthError::InvalidToken) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            error_codes::INVALID_TOKEN,
            "token is missing, malformed or expired",
        )),
        Err(AuthError::PermissionDenied) => Err(error_response(
            StatusCode::FORBIDDEN,
            error_codes::PERMISSION_DENIED,
            "token lacks the realtime permission",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    device: String,
    channel: Option<u32>,
}

async fn latest_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LatestQuery>,
) -> Response {
    if let Err(response) = authorize_request(&state, &headers) {
        return response;
    }
    if !is_strict_ipv4(&query.device) {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::VALIDATION_ERROR,
            "device must be a strict IPv4 address",
        );
    }

    let now = chrono::Utc::now();
    let events = {
        let mut log = state.log.lock().expect("event log lock poisoned");
        match query.channel {
            Some(channel) => log.latest_for_channel(&query.device, channel, now),
            None => log.latest_per_device(&query.device, now),
        }
    };

    let events: Vec<_> = events.iter().map(|e| (**e).clone()).collect();
    Json(json!({ "events": events })).into_response()
}
