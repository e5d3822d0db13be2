// Subscription-counted lifecycle against a mock device: one loop per
// target regardless of subscriber count, last-unsubscribe teardown, cache
// file lifecycle and placeholder fallback.

use std::sync::Arc;
use std::time::Duration;

use af_device::{DeviceClient, DeviceTarget, TransportConfig};
use af_test_utils::MockDeviceServer;
use preview::images::placeholder_jpeg;
use preview::{PreviewConfig, PreviewService};

fn test_config(cache_dir: std::path::PathBuf) -> PreviewConfig {
    let mut cfg = preview::config::load_config_from_str(
        r#"
        [database]
        url = "postgres://nobody@127.0.0.1:1/void"
        [cache]
        dir = "/tmp/ignored"
        [fetch]
        refresh_secs = 1
        http_timeout_secs = 2
        "#,
    )
    .unwrap();
    cfg.cache.dir = cache_dir;
    cfg.fetch.refresh = Duration::from_millis(100);
    cfg
}

async fn service_with_device(device_online: bool) -> (Arc<PreviewService>, MockDeviceServer, tempfile::TempDir) {
    let mut fixture = MockDeviceServer::single_publisher_fixture("started");
    fixture.preview = Some(placeholder_jpeg());
    if !device_online {
        fixture.fail_with = Some(500);
    }
    let device = MockDeviceServer::start_with(fixture).await.unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let client = DeviceClient::new(&TransportConfig {
        request_timeout: Duration::from_secs(2),
        ..TransportConfig::default()
    })
    .unwrap();
    let service = Arc::new(PreviewService::new(client, test_config(tmp.path().to_path_buf())));
    service.set_target(
        1,
        DeviceTarget {
            address: device.address(),
            username: "admin".to_owned(),
            secret: "secret".to_owned(),
        },
    );
    (service, device, tmp)
}

async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

#[tokio::test]
async fn two_subscribers_share_exactly_one_loop() {
    let (service, device, _tmp) = service_with_device(true).await;

    let a = service.subscribe(1, 1, Some("dashboard-a".to_owned())).unwrap();
    assert!(a.is_first);
    assert_eq!(a.subscriber_count, 1);

    let b = service.subscribe(1, 1, Some("dashboard-b".to_owned())).unwrap();
    assert!(!b.is_first);
    assert_eq!(b.subscriber_count, 2);

    assert_eq!(service.live_targets(), vec![((1, 1), 2)]);
    assert!(
        wait_until(Duration::from_secs(5), || service.live_loop_count() == 1).await,
        "exactly one loop must be live"
    );

    // The single loop fills the cache for both subscribers.
    let path = service.cache_path(1, 1);
    assert!(
        wait_until(Duration::from_secs(5), || path.exists()).await,
        "cached frame must appear"
    );
    assert!(device.fixture().hit_count("channels/1/preview") >= 1);
    assert_eq!(
        service.counters.started.load(std::sync::atomic::Ordering::Relaxed),
        1,
        "a second subscription must not start a second loop"
    );

    // First unsubscribe keeps the loop running.
    let receipt = service.unsubscribe(a.subscriber_id).unwrap();
    assert_eq!(receipt.subscriber_count, 1);
    assert!(!receipt.stopped);
    assert_eq!(service.live_loop_count(), 1);

    // Last unsubscribe stops the loop and deletes the file.
    let receipt = service.unsubscribe(b.subscriber_id).unwrap();
    assert_eq!(receipt.subscriber_count, 0);
    assert!(receipt.stopped);
    assert!(
        wait_until(Duration::from_secs(5), || service.live_loop_count() == 0).await,
        "loop must wind down after the last unsubscribe"
    );

    // A tick may have been in flight during teardown; one cleanup cycle
    // bounds any resurrected file.
    if path.exists() {
        preview::cleanup::sweep_cache(service.config().cache.dir.as_path(), Duration::ZERO)
            .unwrap();
    }
    assert!(!path.exists(), "cached file must not outlive its subscribers");

    // Registry returns to its pre-subscribe shape.
    assert!(service.live_targets().is_empty());
    assert_eq!(service.subscriber_count(1, 1), 0);
}

#[tokio::test]
async fn distinct_targets_get_distinct_loops() {
    let (service, _device, _tmp) = service_with_device(true).await;

    let a = service.subscribe(1, 1, None).unwrap();
    let b = service.subscribe(1, 2, None).unwrap();
    assert!(a.is_first);
    assert!(b.is_first, "a different channel is a different target");
    assert_eq!(service.live_targets(), vec![((1, 1), 1), ((1, 2), 1)]);
    assert!(wait_until(Duration::from_secs(5), || service.live_loop_count() == 2).await);
}

#[tokio::test]
async fn unsubscribe_is_rejected_for_unknown_and_repeated_ids() {
    let (service, _device, _tmp) = service_with_device(true).await;

    assert!(service.unsubscribe(uuid::Uuid::new_v4()).is_err());

    let receipt = service.subscribe(1, 1, None).unwrap();
    service.unsubscribe(receipt.subscriber_id).unwrap();
    assert!(
        service.unsubscribe(receipt.subscriber_id).is_err(),
        "a subscriber id is spent after unsubscribe"
    );
}

#[tokio::test]
async fn subscribing_to_an_unknown_device_fails() {
    let (service, _device, _tmp) = service_with_device(true).await;
    assert!(service.subscribe(99, 1, None).is_err());
}

#[tokio::test]
async fn get_image_serves_placeholder_until_a_frame_lands() {
    let (service, _device, _tmp) = service_with_device(true).await;

    let (bytes, placeholder) = service.get_image(1, 1).await;
    assert!(placeholder);
    assert!(image::load_from_memory(&bytes).is_ok(), "placeholder must render");

    let receipt = service.subscribe(1, 1, None).unwrap();
    let path = service.cache_path(1, 1);
    assert!(wait_until(Duration::from_secs(5), || path.exists()).await);

    let (bytes, placeholder) = service.get_image(1, 1).await;
    assert!(!placeholder);
    assert!(image::load_from_memory(&bytes).is_ok());

    service.unsubscribe(receipt.subscriber_id).unwrap();
}

#[tokio::test]
async fn failing_device_backs_off_and_recovers() {
    let (service, device, _tmp) = service_with_device(false).await;

    let receipt = service.subscribe(1, 1, None).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            service.counters.fetches_failed.load(std::sync::atomic::Ordering::Relaxed) >= 2
        })
        .await,
        "failures must be counted"
    );
    assert_eq!(service.live_loop_count(), 1, "backoff suppresses, never kills");

    // Device comes back; the loop recovers and caches a frame.
    device.fixture().fail_with = None;
    let path = service.cache_path(1, 1);
    assert!(
        wait_until(Duration::from_secs(10), || path.exists()).await,
        "a frame must land after recovery"
    );

    service.unsubscribe(receipt.subscriber_id).unwrap();
}
