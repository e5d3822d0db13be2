// Schema validation on the private ingest surface: 400 with the frozen
// error envelope on bad input, 202 on accept.

use std::net::SocketAddr;

use af_protocol::HttpErrorEnvelope;
use af_test_utils::TEST_SIGNING_SECRET;
use hub::AppState;
use serde_json::json;

async fn start_ingest() -> (String, AppState) {
    let config = hub::config::load_config_from_str(&format!(
        r#"
        [database]
        url = "postgres://nobody@127.0.0.1:1/void"
        [auth]
        signing_secret = "{TEST_SIGNING_SECRET}"
        "#
    ))
    .unwrap();
    let pool = hub::db::create_lazy_pool(&config.database_url).unwrap();
    let state = AppState::new(pool, config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/internal/v1/events", listener.local_addr().unwrap());
    let router = hub::ingest::build_router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    (url, state)
}

fn valid_event() -> serde_json::Value {
    json!({
        "type": "recorder_status",
        "device": "10.0.0.2",
        "data": {"recorders": []},
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "source": "poller",
    })
}

async fn post(url: &str, body: serde_json::Value) -> (u16, serde_json::Value) {
    let response = reqwest::Client::new().post(url).json(&body).send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn valid_event_is_accepted() {
    let (url, _state) = start_ingest().await;
    let (status, body) = post(&url, valid_event()).await;
    assert_eq!(status, 202);
    assert_eq!(body["accepted"], true);
    assert!(body["event_id"].is_string());
}

#[tokio::test]
async fn unknown_type_is_a_schema_failure() {
    let (url, _state) = start_ingest().await;
    let mut event = valid_event();
    event["type"] = json!("weather_report");
    let (status, body) = post(&url, event).await;
    assert_eq!(status, 400);
    let envelope: HttpErrorEnvelope = serde_json::from_value(body).unwrap();
    assert_eq!(envelope.code, "VALIDATION_ERROR");
}

#[tokio::test]
async fn non_ipv4_device_is_rejected() {
    let (url, _state) = start_ingest().await;
    for device in ["encoder.local", "10.0.0.2:80", "010.0.0.2", "10.0.0"] {
        let mut event = valid_event();
        event["device"] = json!(device);
        let (status, _) = post(&url, event).await;
        assert_eq!(status, 400, "device '{device}' must be rejected");
    }
}

#[tokio::test]
async fn publisher_without_channel_is_rejected() {
    let (url, _state) = start_ingest().await;
    let mut event = valid_event();
    event["publisher"] = json!("rtmp1");
    let (status, _) = post(&url, event).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn mismatched_change_hash_is_rejected() {
    let (url, _state) = start_ingest().await;
    let mut event = valid_event();
    event["change_hash"] = json!("00000000000000000000000000000000");
    let (status, body) = post(&url, event).await;
    assert_eq!(status, 400);
    let envelope: HttpErrorEnvelope = serde_json::from_value(body).unwrap();
    assert_eq!(envelope.code, "VALIDATION_ERROR");
}

#[tokio::test]
async fn matching_change_hash_is_accepted() {
    let (url, _state) = start_ingest().await;
    let data = json!({"recorders": []});
    let hash = af_protocol::change_hash(
        af_protocol::EventType::RecorderStatus,
        "10.0.0.2",
        None,
        None,
        &data,
    );
    let mut event = valid_event();
    event["change_hash"] = json!(hash);
    let (status, body) = post(&url, event).await;
    assert_eq!(status, 202);
    assert_eq!(body["accepted"], true);
}

#[tokio::test]
async fn rejected_events_do_not_touch_the_log() {
    use std::sync::atomic::Ordering;
    let (url, state) = start_ingest().await;
    let mut event = valid_event();
    event["device"] = json!("nope");
    post(&url, event).await;

    assert_eq!(state.metrics.events_rejected.load(Ordering::Relaxed), 1);
    assert_eq!(state.metrics.events_ingested.load(Ordering::Relaxed), 0);
    let log = state.log.lock().unwrap();
    assert_eq!(log.event_count(), 0);
}
