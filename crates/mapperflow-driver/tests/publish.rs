// Capture-and-report tests using wiremock as the image endpoint.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mapperflow_core::types::{DeviceId, Value};
use mapperflow_driver::{
    DeviceClient, DeviceStatus, DriverError, DriverSettings, ProtocolDriver, SimulatedCamera,
    TriggerMode,
};

const COMMON: &[u8] = br#"{"customizedValues": {"deviceSN": "SN-001"}}"#;
const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; param=value";

fn visitor(feature: &str) -> Vec<u8> {
    format!(r#"{{"protocolName": "GigEVision", "configData": {{"FeatureName": "{feature}"}}}}"#).into_bytes()
}

fn device() -> DeviceId {
    DeviceId::from("SN-001")
}

/// A connected client whose device reports images to `server`
async fn setup(server: &MockServer) -> (Arc<SimulatedCamera>, DeviceClient<SimulatedCamera>) {
    let camera = Arc::new(SimulatedCamera::new());
    camera.add_device("SN-001");
    camera.set_frame("SN-001", b"\x89PNG frame".to_vec());

    let settings = DriverSettings {
        reconnect_interval: Duration::from_secs(3600),
        publish_timeout: Duration::from_secs(5),
        ..DriverSettings::default()
    };
    let client = DeviceClient::new(Arc::clone(&camera), settings);
    assert_ok!(client.init_device(Some(COMMON)).await);

    let url = Value::Text(format!("{}/images", server.uri()));
    assert_ok!(
        client
            .write_device_data(url, None, Some(&visitor("ImageURL")), None)
            .await
    );
    (camera, client)
}

async fn trigger(client: &DeviceClient<SimulatedCamera>, mode: &str) -> mapperflow_driver::Result<()> {
    client
        .write_device_data(Value::Text(mode.into()), None, Some(&visitor("ImageTrigger")), None)
        .await
}

async fn wait_idle(client: &DeviceClient<SimulatedCamera>) {
    let idle = tokio::time::timeout(Duration::from_secs(5), async {
        while client.snapshot(&device()).is_some_and(|s| s.publish_busy) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(idle.is_ok(), "publish pipeline did not finish");
}

#[test_log::test(tokio::test)]
async fn rapid_triggers_post_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/images"))
        .and(header("content-type", CONTENT_TYPE))
        .and(body_json(json!({"size": 10, "value": "iVBORyBmcmFtZQ=="})))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let (camera, client) = setup(&server).await;
    assert_ok!(trigger(&client, "single").await);
    assert!(client.snapshot(&device()).unwrap().publish_busy);
    assert_ok!(trigger(&client, "single").await);

    wait_idle(&client).await;
    assert_eq!(camera.calls().get_image, 1);
    assert_eq!(camera.calls().free, 1);

    let mode = client
        .read_device_data(None, Some(&visitor("ImageTrigger")), None)
        .await
        .unwrap();
    assert_eq!(mode, Value::Text("single".into()));
    server.verify().await;
}

#[tokio::test]
async fn invalid_trigger_issues_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (camera, client) = setup(&server).await;
    let err = assert_err!(trigger(&client, "badmode").await);
    match err {
        DriverError::Validation { feature, reason, .. } => {
            assert_eq!(feature, "ImageTrigger");
            assert_eq!(reason, "allowed values are single, continuous, stop");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(camera.calls().get_image, 0);
    assert!(!client.snapshot(&device()).unwrap().publish_busy);
    server.verify().await;
}

#[tokio::test]
async fn failed_post_frees_pipeline_for_next_trigger() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let (camera, client) = setup(&server).await;
    assert_ok!(trigger(&client, "continuous").await);
    wait_idle(&client).await;
    assert_ok!(trigger(&client, "continuous").await);
    wait_idle(&client).await;

    let snapshot = client.snapshot(&device()).unwrap();
    assert_eq!(snapshot.capture.trigger, TriggerMode::Stop);
    assert_eq!(snapshot.status, DeviceStatus::Connected);
    assert_eq!(camera.calls().free, 2);
    server.verify().await;
}

#[tokio::test]
async fn stop_is_stored_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (_camera, client) = setup(&server).await;
    assert_ok!(trigger(&client, "continuous").await);
    wait_idle(&client).await;
    assert_eq!(client.snapshot(&device()).unwrap().capture.trigger, TriggerMode::Continuous);

    assert_ok!(trigger(&client, "stop").await);
    assert_eq!(client.snapshot(&device()).unwrap().capture.trigger, TriggerMode::Stop);
}

#[tokio::test]
async fn stop_survives_late_upload_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let (_camera, client) = setup(&server).await;
    let image_trigger = visitor("ImageTrigger");
    assert_ok!(trigger(&client, "continuous").await);
    assert_ok!(trigger(&client, "stop").await);

    let now = client.read_device_data(None, Some(&image_trigger), None).await.unwrap();
    assert_eq!(now, Value::Text("stop".into()));

    wait_idle(&client).await;
    let later = client.read_device_data(None, Some(&image_trigger), None).await.unwrap();
    assert_eq!(later, Value::Text("stop".into()));
    server.verify().await;
}

#[tokio::test]
async fn image_format_round_trip() {
    let server = MockServer::start().await;
    let (_camera, client) = setup(&server).await;
    let format = visitor("ImageFormat");

    assert_ok!(
        client
            .write_device_data(Value::Text("pnm".into()), None, Some(&format), None)
            .await
    );
    let err = assert_err!(
        client
            .write_device_data(Value::Text("bmp".into()), None, Some(&format), None)
            .await
    );
    assert!(err.to_string().contains("allowed values are jpeg, png, pnm"));

    let value = client.read_device_data(None, Some(&format), None).await.unwrap();
    assert_eq!(value, Value::Text("pnm".into()));
}

#[tokio::test]
async fn hard_capture_failure_schedules_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (camera, client) = setup(&server).await;
    camera.fail_next_call("SN-001", 2, "stream lost");

    assert_ok!(trigger(&client, "single").await);
    let snapshot = client.snapshot(&device()).unwrap();
    assert_eq!(snapshot.status, DeviceStatus::Disconnected);
    assert_eq!(snapshot.reconnect_loops, 1);
    assert!(!snapshot.publish_busy);
    server.verify().await;
}
