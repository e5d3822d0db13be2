// End-to-end poller pipeline: a mock device is polled by real tier loops,
// and emitted events are captured by a stand-in ingest endpoint.  The
// database pool is lazy and points nowhere, which doubles as the test of
// the core invariant: state writes failing never suppresses event fan-out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use af_device::DeviceClient;
use af_test_utils::MockDeviceServer;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use poller::config::IntervalConfig;
use poller::ingest::EventSink;
use poller::registry::{DeviceRuntime, Registry};
use poller::roster::DeviceRecord;
use poller::tiers::{spawn_device_loops, TierCtx};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Ingest capture endpoint
// ---------------------------------------------------------------------------

type Captured = Arc<Mutex<Vec<Value>>>;

async fn capture_events(State(captured): State<Captured>, Json(body): Json<Value>) -> StatusCode {
    captured.lock().unwrap().push(body);
    StatusCode::ACCEPTED
}

async fn start_capture() -> (String, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let router = Router::new()
        .route("/internal/v1/events", post(capture_events))
        .with_state(captured.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/internal/v1/events", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (url, captured)
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn lazy_pool() -> sqlx::PgPool {
    // Nothing listens here; every state write fails.
    poller::db::create_lazy_pool("postgres://nobody@127.0.0.1:1/void").unwrap()
}

fn device_record(address: String) -> DeviceRecord {
    DeviceRecord {
        device_id: 1,
        address,
        username: "admin".to_owned(),
        secret: "secret".to_owned(),
        display_name: None,
    }
}

fn tier_ctx(address: String, ingest_url: String, registry: Arc<Registry>) -> TierCtx {
    let runtime = Arc::new(DeviceRuntime::new(device_record(address)));
    registry.insert(runtime.clone());
    TierCtx {
        client: DeviceClient::new(&af_device::TransportConfig {
            request_timeout: Duration::from_secs(2),
            ..af_device::TransportConfig::default()
        })
        .unwrap(),
        runtime,
        pool: lazy_pool(),
        sink: EventSink::new(ingest_url, Duration::from_secs(2)).unwrap(),
        registry,
        backoff_policy: af_device::BackoffPolicy::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
            10,
        ),
        intervals: IntervalConfig {
            fast: Duration::from_millis(150),
            medium: Duration::from_millis(200),
            slow: Duration::from_millis(250),
        },
    }
}

async fn wait_for(captured: &Captured, timeout: Duration, predicate: impl Fn(&[Value]) -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        {
            let events = captured.lock().unwrap();
            if predicate(&events) {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn events_of_type<'a>(events: &'a [Value], event_type: &str) -> Vec<&'a Value> {
    events
        .iter()
        .filter(|e| e["type"] == event_type)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn healthy_device_produces_all_event_kinds_despite_db_being_down() {
    let device = MockDeviceServer::start_with(MockDeviceServer::single_publisher_fixture("started"))
        .await
        .unwrap();
    let (ingest_url, captured) = start_capture().await;

    let registry = Arc::new(Registry::new());
    let ctx = tier_ctx(device.address(), ingest_url, registry.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = spawn_device_loops(&ctx, &shutdown_rx);

    wait_for(&captured, Duration::from_secs(5), |events| {
        !events_of_type(events, "device_health").is_empty()
            && !events_of_type(events, "publisher_status").is_empty()
            && !events_of_type(events, "recorder_status").is_empty()
            && !events_of_type(events, "device_channels").is_empty()
            && !events_of_type(events, "publisher_names").is_empty()
            && !events_of_type(events, "system_identity").is_empty()
            && !events_of_type(events, "system_status").is_empty()
    })
    .await;

    {
        let events = captured.lock().unwrap();

        let health = events_of_type(&events, "device_health");
        assert_eq!(health[0]["data"]["status"], "online");
        assert_eq!(health[0]["data"]["device_id"], 1);
        assert_eq!(health[0]["source"], "poller");
        assert!(health[0]["data"].get("channels_count").is_none(), "liveness only");

        let publisher = events_of_type(&events, "publisher_status");
        assert_eq!(publisher[0]["channel"], 1);
        assert_eq!(publisher[0]["publisher"], "rtmp1");
        assert_eq!(publisher[0]["data"]["state"], "started");
        assert_eq!(publisher[0]["change_hash"].as_str().unwrap().len(), 32);

        let names = events_of_type(&events, "publisher_names");
        assert_eq!(names[0]["data"]["names"]["rtmp1"], "Main RTMP");

        let channels = events_of_type(&events, "device_channels");
        assert_eq!(channels[0]["data"]["channels_count"], 1);
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}

#[tokio::test]
async fn unchanged_state_still_emits_on_every_tick() {
    let device = MockDeviceServer::start_with(MockDeviceServer::single_publisher_fixture("started"))
        .await
        .unwrap();
    let (ingest_url, captured) = start_capture().await;

    let registry = Arc::new(Registry::new());
    let ctx = tier_ctx(device.address(), ingest_url, registry);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = spawn_device_loops(&ctx, &shutdown_rx);

    // Nothing on the device ever changes, yet the health event keeps coming.
    wait_for(&captured, Duration::from_secs(5), |events| {
        events_of_type(events, "device_health").len() >= 3
    })
    .await;

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}

#[tokio::test]
async fn unreachable_device_emits_error_health_with_increasing_count() {
    let device = MockDeviceServer::start().await.unwrap();
    device.fixture().fail_with = Some(500);
    let (ingest_url, captured) = start_capture().await;

    let registry = Arc::new(Registry::new());
    let ctx = tier_ctx(device.address(), ingest_url, registry.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = spawn_device_loops(&ctx, &shutdown_rx);

    wait_for(&captured, Duration::from_secs(5), |events| {
        events_of_type(events, "device_health")
            .iter()
            .filter(|e| e["data"]["status"] == "error")
            .count()
            >= 3
    })
    .await;

    {
        let events = captured.lock().unwrap();
        let counts: Vec<i64> = events_of_type(&events, "device_health")
            .iter()
            .filter(|e| e["data"]["status"] == "error")
            .map(|e| e["data"]["error_count"].as_i64().unwrap())
            .collect();
        assert!(
            counts.windows(2).all(|w| w[1] > w[0]),
            "error counts must increase monotonically: {counts:?}"
        );
        assert!(events_of_type(&events, "device_health")[0]["data"]["error"].is_string());
    }

    let runtime = registry.get(1).unwrap();
    assert!(runtime.error_count() >= 3);

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}

#[tokio::test]
async fn publisher_transition_reaches_the_sink_in_order() {
    let device = MockDeviceServer::start_with(MockDeviceServer::single_publisher_fixture("starting"))
        .await
        .unwrap();
    let (ingest_url, captured) = start_capture().await;

    let registry = Arc::new(Registry::new());
    let ctx = tier_ctx(device.address(), ingest_url, registry);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = spawn_device_loops(&ctx, &shutdown_rx);

    wait_for(&captured, Duration::from_secs(5), |events| {
        !events_of_type(events, "publisher_status").is_empty()
    })
    .await;

    // The device flips the publisher to started.
    {
        let mut fixture = device.fixture();
        fixture.publisher_status.insert(
            1,
            serde_json::json!([{"id": "rtmp1", "type": "rtmp",
                "status": {"state": "started", "started": true, "is_configured": true}}]),
        );
    }

    wait_for(&captured, Duration::from_secs(5), |events| {
        events_of_type(events, "publisher_status")
            .iter()
            .any(|e| e["data"]["state"] == "started")
    })
    .await;

    {
        let events = captured.lock().unwrap();
        let states: Vec<String> = events_of_type(&events, "publisher_status")
            .iter()
            .map(|e| e["data"]["state"].as_str().unwrap().to_owned())
            .collect();
        let first_started = states.iter().position(|s| s == "started").unwrap();
        assert!(
            states[..first_started].iter().all(|s| s == "starting"),
            "starting must precede started: {states:?}"
        );
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
