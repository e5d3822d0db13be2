// Device client against a scripted mock appliance: envelope unwrapping,
// shape tolerance, optional-endpoint degradation, auth and control acks.

use std::collections::HashMap;
use std::time::Duration;

use af_device::{
    ControlAction, DeviceClient, DeviceError, DeviceTarget, PreviewParams, PublisherState,
    TransportConfig,
};
use af_test_utils::{DeviceFixture, MockDeviceServer};
use serde_json::json;

fn client() -> DeviceClient {
    DeviceClient::new(&TransportConfig {
        request_timeout: Duration::from_secs(2),
        ..TransportConfig::default()
    })
    .unwrap()
}

fn target(device: &MockDeviceServer) -> DeviceTarget {
    DeviceTarget {
        address: device.address(),
        username: "admin".to_owned(),
        secret: "secret".to_owned(),
    }
}

#[tokio::test]
async fn channels_and_publisher_status_unwrap_the_result_envelope() {
    let device = MockDeviceServer::start_with(MockDeviceServer::single_publisher_fixture("starting"))
        .await
        .unwrap();
    let client = client();
    let target = target(&device);

    let channels = client.get_channels(&target).await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].id, 1);
    assert_eq!(channels[0].publishers[0].id, "rtmp1");

    let publishers = client.get_publisher_status(&target, 1).await.unwrap();
    assert_eq!(publishers.len(), 1);
    assert_eq!(publishers[0].state, PublisherState::Starting);
    assert_eq!(publishers[0].kind, "rtmp");
    assert!(publishers[0].is_configured);
}

#[tokio::test]
async fn publisher_name_accepts_both_wire_shapes_and_degrades() {
    let mut fixture = MockDeviceServer::single_publisher_fixture("started");
    fixture.publisher_names = HashMap::from([
        ((1, "plain".to_owned()), json!("Stage Feed")),
        ((1, "object".to_owned()), json!({"name": "Backup SRT"})),
    ]);
    let device = MockDeviceServer::start_with(fixture).await.unwrap();
    let client = client();
    let target = target(&device);

    assert_eq!(client.get_publisher_name(&target, 1, "plain").await, "Stage Feed");
    assert_eq!(client.get_publisher_name(&target, 1, "object").await, "Backup SRT");
    // Unknown publisher 404s -> synthetic name, never an error.
    assert_eq!(
        client.get_publisher_name(&target, 1, "ghost").await,
        "Publisher ghost"
    );
}

#[tokio::test]
async fn missing_recorder_endpoint_is_an_empty_list() {
    let mut fixture = MockDeviceServer::single_publisher_fixture("started");
    fixture.recorders = None;
    let device = MockDeviceServer::start_with(fixture).await.unwrap();

    let recorders = client().get_recorder_status(&target(&device)).await.unwrap();
    assert!(recorders.is_empty());
}

#[tokio::test]
async fn basic_auth_is_sent_and_401_is_classified() {
    let mut fixture = MockDeviceServer::single_publisher_fixture("started");
    fixture.require_auth = Some(("admin".to_owned(), "secret".to_owned()));
    let device = MockDeviceServer::start_with(fixture).await.unwrap();
    let client = client();

    // Right credentials succeed.
    assert!(client.get_system_identity(&target(&device)).await.is_ok());

    // Wrong secret is Unauthorized, a non-transient classification.
    let bad = DeviceTarget {
        secret: "wrong".to_owned(),
        ..target(&device)
    };
    let err = client.get_system_identity(&bad).await.unwrap_err();
    assert!(matches!(err, DeviceError::Unauthorized));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn server_errors_are_transient() {
    let device = MockDeviceServer::start().await.unwrap();
    device.fixture().fail_with = Some(503);

    let err = client().get_system_status(&target(&device)).await.unwrap_err();
    assert!(matches!(err, DeviceError::Http(503)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn connection_refused_is_classified() {
    // Nothing listens on this port.
    let target = DeviceTarget {
        address: "127.0.0.1:1".to_owned(),
        username: "admin".to_owned(),
        secret: "secret".to_owned(),
    };
    let err = client().get_system_status(&target).await.unwrap_err();
    assert!(matches!(err, DeviceError::ConnectionRefused), "got {err:?}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn control_endpoints_post_and_ack() {
    let device = MockDeviceServer::start_with(MockDeviceServer::single_publisher_fixture("stopped"))
        .await
        .unwrap();
    let client = client();
    let target = target(&device);

    client
        .control_publisher(&target, 1, "rtmp1", ControlAction::Start)
        .await
        .unwrap();
    client
        .control_recorder(&target, "1", ControlAction::Stop)
        .await
        .unwrap();

    assert_eq!(
        device.fixture().control_log,
        vec![
            "channels/1/publishers/rtmp1/control/start".to_owned(),
            "recorders/1/control/stop".to_owned(),
        ]
    );
}

#[tokio::test]
async fn preview_returns_raw_bytes_with_query_params() {
    let device = MockDeviceServer::start_with(MockDeviceServer::single_publisher_fixture("started"))
        .await
        .unwrap();
    let bytes = client()
        .get_preview(&target(&device), 1, &PreviewParams::default())
        .await
        .unwrap();
    assert_eq!(bytes.as_ref(), &[0xFF, 0xD8, 0xFF, 0xE0]);
    assert_eq!(device.fixture().hit_count("channels/1/preview"), 1);
}
