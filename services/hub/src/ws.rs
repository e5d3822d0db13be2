//! Client-facing WebSocket surface.
//!
//! Upgrade carries a bearer token in the URL query.  After auth the client
//! drives subscribe/unsubscribe; the hub pushes `data_update` frames for
//! every event published to a subscribed key (exact or ancestor).  The
//! transport is stateless and cache-free: no dedup, no buffering beyond the
//! per-subscription broadcast queue, `cached: false` on every frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use af_protocol::{
    error_codes, ClientMessage, ErrorFrame, Event, ServerMessage, SubscriptionKey,
};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn};

use crate::auth::{authorize, AuthError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/events", get(ws_handler))
        .with_state(state.clone())
        .merge(crate::queries::build_router(state))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr, query.token))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerMessage) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn send_ws_error(socket: &mut WebSocket, code: &str, message: &str, retryable: bool) {
    let frame = ServerMessage::Error(ErrorFrame {
        code: code.to_owned(),
        message: message.to_owned(),
        retryable,
    });
    let _ = send_frame(socket, &frame).await;
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    addr: SocketAddr,
    token: Option<String>,
) {
    let token = match token {
        Some(token) => token,
        None => {
            send_ws_error(&mut socket, error_codes::INVALID_TOKEN, "missing token", false).await;
            return;
        }
    };
    let claims = match authorize(&state.config.auth, &token) {
        Ok(claims) => claims,
        Err(AuthError::InvalidToken) => {
            send_ws_error(
                &mut socket,
                error_codes::INVALID_TOKEN,
                "token is missing, malformed or expired",
                false,
            )
            .await;
            return;
        }
        Err(AuthError::PermissionDenied) => {
            send_ws_error(
                &mut socket,
                error_codes::PERMISSION_DENIED,
                "token lacks the realtime permission",
                false,
            )
            .await;
            return;
        }
    };

    let ip = addr.ip();
    if !state.try_claim_connection(ip) {
        send_ws_error(
            &mut socket,
            error_codes::CONNECTION_LIMIT,
            "too many connections from this address",
            true,
        )
        .await;
        return;
    }
    info!(client = %claims.sub, remote = %addr, "client connected");

    client_loop(&mut socket, &state, &claims.sub).await;

    state.release_connection(ip);
    info!(client = %claims.sub, remote = %addr, "client disconnected");
}

async fn client_loop(socket: &mut WebSocket, state: &AppState, client: &str) {
    let limits = &state.config.limits;
    let mut subscribed: HashMap<String, SubscriptionKey> = HashMap::new();
    let mut streams: StreamMap<String, BroadcastStream<Arc<Event>>> = StreamMap::new();
    let mut violations = 0u32;
    let mut deadline = tokio::time::Instant::now() + limits.ping_grace;

    loop {
        tokio::select! {
            biased;
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > limits.max_message_bytes {
                            send_ws_error(socket, error_codes::MESSAGE_TOO_LARGE,
                                "message exceeds size limit", false).await;
                            violations += 1;
                        } else {
                            match serde_json::from_str::<ClientMessage>(&text) {
                                Ok(message) => {
                                    deadline = tokio::time::Instant::now() + limits.ping_grace;
                                    if !handle_client_message(
                                        socket, state, client, message,
                                        &mut subscribed, &mut streams, &mut violations,
                                    ).await {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    send_ws_error(socket, error_codes::PROTOCOL_ERROR,
                                        &format!("invalid message: {e}"), false).await;
                                    violations += 1;
                                }
                            }
                        }
                        if violations >= limits.max_violations {
                            warn!(client, violations, "closing client after repeated violations");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        deadline = tokio::time::Instant::now() + limits.ping_grace;
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client, error = %e, "socket error");
                        break;
                    }
                }
            }
            Some((key, item)) = streams.next(), if !streams.is_empty() => {
                match item {
                    Ok(event) => {
                        if let Some(subscription) = subscribed.get(&key) {
                            let frame = ServerMessage::data_update(subscription, &event);
                            if !send_frame(socket, &frame).await {
                                break;
                            }
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        // Slow consumer: its own oldest entries are gone,
                        // nothing else is affected.
                        state.metrics.frames_dropped.fetch_add(n, Ordering::Relaxed);
                        debug!(client, key = %key, dropped = n, "subscription queue overflowed");
                    }
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                send_ws_error(socket, error_codes::PROTOCOL_ERROR,
                    "liveness ping not received in time", true).await;
                info!(client, "reaping inactive connection");
                break;
            }
        }
    }
}

/// Returns false when the connection should close.
async fn handle_client_message(
    socket: &mut WebSocket,
    state: &AppState,
    client: &str,
    message: ClientMessage,
    subscribed: &mut HashMap<String, SubscriptionKey>,
    streams: &mut StreamMap<String, BroadcastStream<Arc<Event>>>,
    violations: &mut u32,
) -> bool {
    match message {
        ClientMessage::Ping => send_frame(socket, &ServerMessage::Pong).await,
        ClientMessage::Subscribe { data_type, device, channel, publisher_id } => {
            let key = match SubscriptionKey::new(data_type, device, channel, publisher_id) {
                Ok(key) => key,
                Err(e) => {
                    send_ws_error(socket, af_protocol::error_codes::VALIDATION_ERROR,
                        &e.to_string(), false).await;
                    *violations += 1;
                    return true;
                }
            };
            let key_string = key.to_string();

            if !subscribed.contains_key(&key_string) {
                if subscribed.len() >= state.config.limits.max_subscriptions_per_client {
                    send_ws_error(socket, af_protocol::error_codes::SUBSCRIPTION_LIMIT,
                        "subscription limit reached", false).await;
                    return true;
                }
                let rx = state.registry.get_or_create(&key_string).subscribe();
                streams.insert(key_string.clone(), BroadcastStream::new(rx));
                subscribed.insert(key_string.clone(), key.clone());
                debug!(client, key = %key_string, "subscribed");
            }

            if !send_frame(socket, &ServerMessage::Subscribed {
                subscription_key: key_string.clone(),
            }).await {
                return false;
            }

            // Catch-up replay from the source-side ring, oldest first, then
            // the live stream takes over.  Replayed frames are ordinary
            // data_update frames; the transport itself stays cache-free.
            let retained = {
                let mut log = state.log.lock().expect("event log lock poisoned");
                log.latest_for_key(&key_string, chrono::Utc::now())
            };
            for event in retained {
                let frame = ServerMessage::data_update(&key, &event);
                if !send_frame(socket, &frame).await {
                    return false;
                }
                state.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            true
        }
        ClientMessage::Unsubscribe { data_type, device, channel, publisher_id } => {
            let key = match SubscriptionKey::new(data_type, device, channel, publisher_id) {
                Ok(key) => key,
                Err(e) => {
                    send_ws_error(socket, af_protocol::error_codes::VALIDATION_ERROR,
                        &e.to_string(), false).await;
                    *violations += 1;
                    return true;
                }
            };
            let key_string = key.to_string();
            subscribed.remove(&key_string);
            streams.remove(&key_string);
            debug!(client, key = %key_string, "unsubscribed");
            send_frame(socket, &ServerMessage::Unsubscribed {
                subscription_key: key_string,
            }).await
        }
    }
}
