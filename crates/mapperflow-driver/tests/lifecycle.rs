// Lifecycle tests for `DeviceClient` against the simulated camera.

use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use mapperflow_core::types::{DeviceId, Value};
use mapperflow_driver::{
    DeviceClient, DeviceStatus, DriverError, DriverSettings, ProtocolDriver, SimulatedCamera,
};

const COMMON: &[u8] = br#"{"customizedValues": {"deviceSN": "SN-001"}}"#;
const PROTOCOL: &[u8] = br#"{"protocolName": "GigEVision", "configData": {"packetSize": 1500}}"#;

fn visitor(feature: &str) -> Vec<u8> {
    format!(r#"{{"protocolName": "GigEVision", "configData": {{"FeatureName": "{feature}"}}}}"#).into_bytes()
}

fn device() -> DeviceId {
    DeviceId::from("SN-001")
}

type Fixture = (Arc<SimulatedCamera>, Arc<DeviceClient<SimulatedCamera>>);

fn setup(interval: Duration, max_retry: u32) -> Fixture {
    let camera = Arc::new(SimulatedCamera::new());
    camera.add_device("SN-001");
    camera.set_feature("SN-001", "Gain", "10");
    camera.set_feature("SN-001", "ExposureTime", "2000");

    let settings = DriverSettings {
        reconnect_interval: interval,
        max_retry,
        ..DriverSettings::default()
    };
    let client = Arc::new(DeviceClient::new(Arc::clone(&camera), settings));
    (camera, client)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[test_log::test(tokio::test)]
async fn failed_init_recovers_in_background() {
    let interval = Duration::from_millis(20);
    let (camera, client) = setup(interval, 5);
    camera.fail_next_opens("SN-001", 2);

    assert_ok!(client.init_device(Some(COMMON)).await);
    assert!(!client.get_device_status(None, None, None).await);

    let deadline = interval * 5 + Duration::from_secs(1);
    let recovered = tokio::time::timeout(deadline, async {
        while !client.get_device_status(None, None, None).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(recovered.is_ok(), "device did not reconnect within the retry budget");

    let snapshot = client.snapshot(&device()).unwrap();
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(snapshot.reconnect_loops, 1);
    assert_eq!(camera.open_handles("SN-001"), 1);
}

#[tokio::test]
async fn visitor_only_config_keeps_other_parts() {
    let (_camera, client) = setup(Duration::from_secs(3600), 3);
    assert_ok!(client.init_device(Some(COMMON)).await);
    assert_ok!(
        client
            .set_config(Some(COMMON), Some(&visitor("Gain")), Some(PROTOCOL))
            .await
    );
    let before = client.config();

    assert_ok!(client.set_config(None, Some(&visitor("ExposureTime")), None).await);
    let after = client.config();

    assert_eq!(after.common, before.common);
    assert_eq!(after.protocol, before.protocol);
    assert_eq!(client.snapshot(&device()).unwrap().active_feature, "ExposureTime");

    let value = client.read_device_data(None, None, None).await.unwrap();
    assert_eq!(value, Value::Text("2000".into()));
}

#[tokio::test]
async fn malformed_blob_applies_nothing() {
    let (_camera, client) = setup(Duration::from_secs(3600), 3);
    assert_ok!(client.init_device(Some(COMMON)).await);
    assert_ok!(client.set_config(None, Some(&visitor("Gain")), None).await);
    let before = client.config();

    let err = assert_err!(
        client
            .set_config(None, Some(&visitor("ExposureTime")), Some(b"[1, 2"))
            .await
    );
    assert!(matches!(err, DriverError::Decode { .. }));
    assert_eq!(*client.config(), *before);
    assert_eq!(client.snapshot(&device()).unwrap().active_feature, "Gain");
}

#[tokio::test]
async fn numeric_write_reads_back_canonical_text() {
    let (_camera, client) = setup(Duration::from_secs(3600), 3);
    assert_ok!(client.init_device(Some(COMMON)).await);
    let max_retry = visitor("MaxRetryTimes");

    assert_ok!(
        client
            .write_device_data(Value::U16(5), None, Some(&max_retry), None)
            .await
    );
    let value = client.read_device_data(None, Some(&max_retry), None).await.unwrap();
    assert_eq!(value, Value::Text("5".into()));
}

#[tokio::test]
async fn unsupported_value_never_reaches_hardware() {
    let (camera, client) = setup(Duration::from_secs(3600), 3);
    assert_ok!(client.init_device(Some(COMMON)).await);

    let value = Value::List(vec![Value::F64(1.5), Value::F64(2.5)]);
    let err = assert_err!(
        client
            .write_device_data(value, None, Some(&visitor("Gain")), None)
            .await
    );
    assert!(matches!(err, DriverError::UnsupportedType(_)));
    assert_eq!(camera.calls().set, 0);
    assert_eq!(camera.feature("SN-001", "Gain").as_deref(), Some("10"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_hard_failures_start_one_reconnect() {
    let (camera, client) = setup(Duration::from_secs(3600), 3);
    assert_ok!(client.init_device(Some(COMMON)).await);
    assert_ok!(client.set_config(None, Some(&visitor("Gain")), None).await);
    camera.fail_next_call("SN-001", 2, "link lost");
    camera.fail_next_call("SN-001", 2, "link lost");

    let reads: Vec<_> = (0..2)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.read_device_data(None, None, None).await })
        })
        .collect();

    let mut link_down = 0;
    for read in reads {
        match read.await.unwrap() {
            Err(DriverError::HardHardware { .. }) => link_down += 1,
            Err(DriverError::NotConnected(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    assert!(link_down >= 1);
    assert_eq!(client.status(&device()), Some(DeviceStatus::Disconnected));
    assert_eq!(client.snapshot(&device()).unwrap().reconnect_loops, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_feature_follows_last_merge() {
    let (_camera, client) = setup(Duration::from_secs(3600), 3);
    assert_ok!(client.init_device(Some(COMMON)).await);
    let features = ["Gain", "ExposureTime", "Width", "Height", "OffsetX", "OffsetY", "PixelFormat", "Gamma"];

    for _ in 0..200 {
        let calls: Vec<_> = features
            .iter()
            .map(|feature| {
                let client = Arc::clone(&client);
                let blob = visitor(feature);
                tokio::spawn(async move { client.set_config(None, Some(&blob), None).await })
            })
            .collect();
        for call in calls {
            assert_ok!(call.await.unwrap());
        }

        let stored = client.config().feature_name().to_string();
        assert_eq!(client.snapshot(&device()).unwrap().active_feature, stored);
    }
}

#[tokio::test]
async fn repeated_init_while_reconnecting_is_a_no_op() {
    let (camera, client) = setup(Duration::from_millis(20), 1000);
    camera.fail_next_opens("SN-001", u32::MAX);

    for _ in 0..3 {
        assert_ok!(client.init_device(Some(COMMON)).await);
    }
    assert_eq!(client.snapshot(&device()).unwrap().reconnect_loops, 1);
    assert_eq!(camera.calls().open, 1);

    assert_ok!(client.stop_device().await);
}

#[tokio::test]
async fn exhausted_device_waits_for_reinit() {
    let (camera, client) = setup(Duration::from_millis(10), 2);
    camera.remove_device("SN-001");

    assert_ok!(client.init_device(Some(COMMON)).await);
    // One initial open plus two retries
    eventually("retries to run out", || camera.calls().open == 3).await;
    eventually("the loop to settle", || {
        client.snapshot(&device()).map(|s| s.retry_count) == Some(2)
            && client.status(&device()) == Some(DeviceStatus::Disconnected)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(camera.calls().open, 3);

    camera.add_device("SN-001");
    assert_ok!(client.init_device(Some(COMMON)).await);
    assert!(client.get_device_status(None, None, None).await);
}

#[tokio::test]
async fn stop_device_cancels_reconnect() {
    let (camera, client) = setup(Duration::from_millis(10), 1000);
    camera.fail_next_opens("SN-001", u32::MAX);

    assert_ok!(client.init_device(Some(COMMON)).await);
    eventually("a reconnect attempt", || camera.calls().open >= 2).await;

    assert_ok!(client.stop_device().await);
    let opens = camera.calls().open;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(camera.calls().open <= opens + 1);
    assert_eq!(client.status(&device()), Some(DeviceStatus::Disconnected));
}

#[tokio::test]
async fn read_requires_connection() {
    let (camera, client) = setup(Duration::from_secs(3600), 3);
    camera.fail_next_opens("SN-001", 1);
    assert_ok!(client.init_device(Some(COMMON)).await);

    let err = assert_err!(client.read_device_data(None, Some(&visitor("Gain")), None).await);
    assert_eq!(err.to_string(), "device SN-001 is unreachable");
    assert_eq!(camera.calls().get, 0);
}
