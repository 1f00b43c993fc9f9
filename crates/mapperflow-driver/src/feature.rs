/*!
 * Feature dispatch.
 *
 * A handful of feature names are handled by the driver itself and keep
 * their state in the device record. Every other name goes verbatim to the
 * hardware ABI. Hardware failures are classified by their signal: soft ones
 * are returned to the caller, hard ones are returned and also hand the
 * device to the reconnect supervisor.
 */
use std::sync::Arc;

use tracing::{error, warn};
use url::Url;

use mapperflow_core::types::Value;

use crate::device::{DeviceEntry, DeviceRecord, ImageFormat, TriggerMode};
use crate::error::{DriverError, Result};
use crate::hardware::{call_blocking, CameraAbi, HardwareError};
use crate::publisher::AsyncPublisher;
use crate::reconnect::ReconnectSupervisor;

type Entry<A> = Arc<DeviceEntry<<A as CameraAbi>::Handle>>;

/// Features served from driver state instead of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualFeature {
    /// Capture trigger; writing `single` or `continuous` starts a capture
    ImageTrigger,
    /// Image encoding requested from the device
    ImageFormat,
    /// Report endpoint for captured images
    ImageUrl,
    /// Reconnect attempts before giving up
    MaxRetryTimes,
}

impl VirtualFeature {
    /// Every virtual feature
    pub const ALL: [VirtualFeature; 4] = [
        VirtualFeature::ImageTrigger,
        VirtualFeature::ImageFormat,
        VirtualFeature::ImageUrl,
        VirtualFeature::MaxRetryTimes,
    ];

    /// Feature name as it appears in visitor configs
    pub fn name(&self) -> &'static str {
        match self {
            VirtualFeature::ImageTrigger => "ImageTrigger",
            VirtualFeature::ImageFormat => "ImageFormat",
            VirtualFeature::ImageUrl => "ImageURL",
            VirtualFeature::MaxRetryTimes => "MaxRetryTimes",
        }
    }

    /// Look a feature name up; names are case-sensitive
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|feature| feature.name() == name)
    }

    fn read<H>(&self, record: &DeviceRecord<H>) -> String {
        match self {
            VirtualFeature::ImageTrigger => record.capture.trigger.as_str().to_string(),
            VirtualFeature::ImageFormat => record.capture.format.as_str().to_string(),
            VirtualFeature::ImageUrl => record
                .capture
                .endpoint
                .as_ref()
                .map(Url::to_string)
                .unwrap_or_default(),
            VirtualFeature::MaxRetryTimes => record.max_retry.to_string(),
        }
    }
}

fn allowed_values<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    format!("allowed values are {}", values.into_iter().collect::<Vec<_>>().join(", "))
}

fn parse_endpoint(text: &str) -> Result<Option<Url>> {
    if text.is_empty() {
        return Ok(None);
    }
    let reason = "expected an absolute http or https URL";
    let url = Url::parse(text)
        .map_err(|e| DriverError::validation("ImageURL", text, format!("{} ({})", reason, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(Some(url)),
        _ => Err(DriverError::validation("ImageURL", text, reason)),
    }
}

/// Routes feature reads and writes of a device
pub struct FeatureDispatcher<A: CameraAbi> {
    abi: Arc<A>,
    supervisor: ReconnectSupervisor<A>,
    publisher: AsyncPublisher<A>,
}

impl<A: CameraAbi> FeatureDispatcher<A> {
    /// Create a dispatcher
    pub fn new(abi: Arc<A>, supervisor: ReconnectSupervisor<A>, publisher: AsyncPublisher<A>) -> Self {
        Self {
            abi,
            supervisor,
            publisher,
        }
    }

    /// The supervisor hard failures are reported to
    pub fn supervisor(&self) -> &ReconnectSupervisor<A> {
        &self.supervisor
    }

    /// Read a feature of a connected device
    pub fn read(&self, entry: &Entry<A>, feature: &str) -> Result<Value> {
        ensure_connected(entry)?;

        if let Some(virtual_feature) = VirtualFeature::from_name(feature) {
            let record = entry.lock();
            return Ok(Value::Text(virtual_feature.read(&record)));
        }

        let (epoch, outcome) = {
            let record = entry.lock();
            let handle = open_handle(entry, &record)?;
            (record.link_epoch, call_blocking(|| self.abi.get(handle, feature)))
        };
        outcome
            .map(Value::Text)
            .map_err(|e| self.hardware_failure(entry, epoch, "get", feature, e))
    }

    /// Write a feature of a connected device.
    ///
    /// The value is canonicalized before anything else, so a value without
    /// a wire form never reaches the device.
    pub fn write(&self, entry: &Entry<A>, feature: &str, value: &Value) -> Result<()> {
        let text = value.to_wire_string()?;
        ensure_connected(entry)?;

        if let Some(virtual_feature) = VirtualFeature::from_name(feature) {
            return self.write_virtual(entry, virtual_feature, &text);
        }

        let (epoch, outcome) = {
            let record = entry.lock();
            let handle = open_handle(entry, &record)?;
            (record.link_epoch, call_blocking(|| self.abi.set(handle, feature, &text)))
        };
        outcome.map_err(|e| self.hardware_failure(entry, epoch, "set", feature, e))
    }

    fn write_virtual(&self, entry: &Entry<A>, feature: VirtualFeature, text: &str) -> Result<()> {
        match feature {
            VirtualFeature::ImageTrigger => {
                let mode = TriggerMode::parse(text).ok_or_else(|| {
                    DriverError::validation(
                        feature.name(),
                        text,
                        allowed_values(TriggerMode::ALLOWED.iter().map(|m| m.as_str())),
                    )
                })?;
                self.trigger(entry, mode);
            }
            VirtualFeature::ImageFormat => {
                let format = ImageFormat::parse(text).ok_or_else(|| {
                    DriverError::validation(
                        feature.name(),
                        text,
                        allowed_values(ImageFormat::ALLOWED.iter().map(|f| f.as_str())),
                    )
                })?;
                entry.lock().capture.format = format;
            }
            VirtualFeature::ImageUrl => {
                let endpoint = parse_endpoint(text.trim())?;
                entry.lock().capture.endpoint = endpoint;
            }
            VirtualFeature::MaxRetryTimes => {
                let max_retry = text.trim().parse::<u32>().map_err(|_| {
                    DriverError::validation(feature.name(), text, "expected a non-negative integer")
                })?;
                entry.lock().max_retry = max_retry;
            }
        }
        Ok(())
    }

    /// Capture failures are logged rather than returned; the trigger itself
    /// was accepted.
    fn trigger(&self, entry: &Entry<A>, mode: TriggerMode) {
        if !mode.starts_capture() {
            let mut record = entry.lock();
            // Uploads still in flight must not overwrite the stop
            record.next_trigger_generation();
            record.capture.trigger = TriggerMode::Stop;
            return;
        }

        let (epoch, outcome) = {
            let mut record = entry.lock();
            let epoch = record.link_epoch;
            (epoch, self.publisher.trigger(entry, &mut record, mode))
        };
        if let Err(e) = outcome {
            error!("Failed to get images of device {}: {}", entry.id(), e.message);
            if e.is_hard() {
                self.supervisor.link_down(entry, epoch);
            }
        }
    }

    fn hardware_failure(
        &self,
        entry: &Entry<A>,
        epoch: u64,
        op: &str,
        feature: &str,
        e: HardwareError,
    ) -> DriverError {
        let device = entry.id().clone();
        let message = format!("{} {} from device {} failed: {}", op, feature, device, e.message);
        if e.is_hard() {
            warn!("{}", message);
            self.supervisor.link_down(entry, epoch);
            DriverError::HardHardware { device, message }
        } else {
            DriverError::SoftHardware { device, message }
        }
    }
}

fn ensure_connected<H>(entry: &DeviceEntry<H>) -> Result<()> {
    if entry.status().is_connected() {
        Ok(())
    } else {
        Err(DriverError::NotConnected(entry.id().clone()))
    }
}

fn open_handle<'r, H>(entry: &DeviceEntry<H>, record: &'r DeviceRecord<H>) -> Result<&'r H> {
    record
        .handle
        .as_ref()
        .ok_or_else(|| DriverError::NotConnected(entry.id().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::device::{CaptureConfig, DeviceStatus};
    use crate::simulated::SimulatedCamera;
    use mapperflow_core::types::DeviceId;

    struct Fixture {
        camera: Arc<SimulatedCamera>,
        dispatcher: FeatureDispatcher<SimulatedCamera>,
        entry: Entry<SimulatedCamera>,
    }

    async fn connected() -> Fixture {
        let camera = Arc::new(SimulatedCamera::new());
        camera.add_device("cam-1");
        camera.set_feature("cam-1", "Gain", "12");

        // Long interval so background reconnects stay out of the way
        let supervisor = ReconnectSupervisor::new(Arc::clone(&camera), Duration::from_secs(3600));
        let publisher = AsyncPublisher::new(Arc::clone(&camera), reqwest::Client::new(), Duration::from_secs(5));
        let dispatcher = FeatureDispatcher::new(Arc::clone(&camera), supervisor, publisher);

        let entry = Arc::new(DeviceEntry::new(DeviceId::from("cam-1"), CaptureConfig::default(), 3));
        assert_eq!(dispatcher.supervisor().connect(&entry).await, DeviceStatus::Connected);
        Fixture {
            camera,
            dispatcher,
            entry,
        }
    }

    #[tokio::test]
    async fn test_hardware_features_are_forwarded() {
        let f = connected().await;
        assert_eq!(f.dispatcher.read(&f.entry, "Gain").unwrap(), Value::Text("12".into()));

        f.dispatcher.write(&f.entry, "Gain", &Value::F32(0.5)).unwrap();
        assert_eq!(f.camera.feature("cam-1", "Gain").as_deref(), Some("0.5"));
        f.dispatcher.write(&f.entry, "ReverseX", &Value::Bool(true)).unwrap();
        assert_eq!(f.camera.feature("cam-1", "ReverseX").as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_virtual_features_never_reach_hardware() {
        let f = connected().await;
        f.dispatcher
            .write(&f.entry, "ImageFormat", &Value::Text("png".into()))
            .unwrap();
        assert_eq!(
            f.dispatcher.read(&f.entry, "ImageFormat").unwrap(),
            Value::Text("png".into())
        );
        assert_eq!(f.dispatcher.read(&f.entry, "ImageTrigger").unwrap(), Value::Text("stop".into()));
        assert_eq!(f.dispatcher.read(&f.entry, "ImageURL").unwrap(), Value::Text(String::new()));

        let calls = f.camera.calls();
        assert_eq!(calls.get, 0);
        assert_eq!(calls.set, 0);
    }

    #[tokio::test]
    async fn test_numeric_write_reads_back_canonical_text() {
        let f = connected().await;
        f.dispatcher.write(&f.entry, "MaxRetryTimes", &Value::U16(5)).unwrap();
        assert_eq!(
            f.dispatcher.read(&f.entry, "MaxRetryTimes").unwrap(),
            Value::Text("5".into())
        );
        assert_eq!(f.entry.snapshot().max_retry, 5);

        let err = f
            .dispatcher
            .write(&f.entry, "MaxRetryTimes", &Value::I32(-1))
            .unwrap_err();
        assert!(matches!(err, DriverError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_invalid_trigger_names_allowed_values() {
        let f = connected().await;
        let err = f
            .dispatcher
            .write(&f.entry, "ImageTrigger", &Value::Text("badmode".into()))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"invalid value "badmode" for ImageTrigger: allowed values are single, continuous, stop"#
        );
        assert_eq!(f.camera.calls().get_image, 0);
    }

    #[tokio::test]
    async fn test_image_url_validation() {
        let f = connected().await;
        f.dispatcher
            .write(&f.entry, "ImageURL", &Value::Text("  http://collector:8080/images  ".into()))
            .unwrap();
        assert_eq!(
            f.dispatcher.read(&f.entry, "ImageURL").unwrap(),
            Value::Text("http://collector:8080/images".into())
        );

        for bad in ["ftp://collector/images", "/images"] {
            let err = f
                .dispatcher
                .write(&f.entry, "ImageURL", &Value::Text(bad.into()))
                .unwrap_err();
            assert!(matches!(err, DriverError::Validation { .. }), "{bad} accepted");
        }

        f.dispatcher
            .write(&f.entry, "ImageURL", &Value::Text(String::new()))
            .unwrap();
        assert!(f.entry.snapshot().capture.endpoint.is_none());
    }

    #[tokio::test]
    async fn test_trigger_without_endpoint_is_accepted() {
        let f = connected().await;
        f.dispatcher
            .write(&f.entry, "ImageTrigger", &Value::Text("single".into()))
            .unwrap();
        assert_eq!(f.camera.calls().get_image, 0);
        assert_eq!(f.entry.snapshot().capture.trigger, TriggerMode::Stop);
    }

    #[tokio::test]
    async fn test_unsupported_value_makes_no_hardware_call() {
        let f = connected().await;
        let err = f
            .dispatcher
            .write(&f.entry, "Gain", &Value::List(vec![Value::I32(1)]))
            .unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedType(_)));
        assert_eq!(f.camera.calls().set, 0);
    }

    #[tokio::test]
    async fn test_soft_failure_keeps_device_connected() {
        let f = connected().await;
        f.camera.fail_next_call("cam-1", 1, "feature locked");

        let err = f.dispatcher.write(&f.entry, "Gain", &Value::I32(3)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "device cam-1: set Gain from device cam-1 failed: feature locked"
        );
        assert_eq!(f.entry.status(), DeviceStatus::Connected);
        assert_eq!(f.entry.snapshot().reconnect_loops, 0);
    }

    #[tokio::test]
    async fn test_hard_failure_schedules_one_reconnect() {
        let f = connected().await;
        f.camera.fail_next_call("cam-1", 2, "link lost");
        f.camera.fail_next_call("cam-1", 3, "link lost");

        let first = f.dispatcher.read(&f.entry, "Gain").unwrap_err();
        assert!(first.is_link_down());
        assert_eq!(f.entry.status(), DeviceStatus::Disconnected);

        // The device is no longer connected, so the second call is refused
        let second = f.dispatcher.read(&f.entry, "Gain").unwrap_err();
        assert!(matches!(second, DriverError::NotConnected(_)));
        assert_eq!(f.entry.snapshot().reconnect_loops, 1);
    }

    #[test]
    fn test_virtual_feature_names() {
        assert_eq!(VirtualFeature::from_name("ImageURL"), Some(VirtualFeature::ImageUrl));
        assert_eq!(VirtualFeature::from_name("imageurl"), None);
        assert_eq!(VirtualFeature::from_name("Gain"), None);
    }
}
