/*!
 * Per-device state.
 *
 * A [`DeviceEntry`] owns everything the driver knows about one physical
 * device. The handle, capture settings and bookkeeping live in a single
 * [`DeviceRecord`] behind one mutex, so a dispatcher call can never observe
 * a handle that a reconnect is in the middle of replacing. The connection
 * status is published separately through a watch channel so status reads
 * never wait for a hardware call.
 */
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use mapperflow_core::types::DeviceId;

/// Connection status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DeviceStatus {
    /// The handle is open and calls are forwarded
    Connected,
    /// No usable handle
    Disconnected,
    /// A reconnect loop is running its `attempt`-th try
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
}

impl DeviceStatus {
    /// Whether calls can be forwarded to the device
    pub fn is_connected(&self) -> bool {
        matches!(self, DeviceStatus::Connected)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Connected => f.write_str("connected"),
            DeviceStatus::Disconnected => f.write_str("disconnected"),
            DeviceStatus::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
        }
    }
}

/// What a write to the trigger feature asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Capture and report one image
    Single,
    /// Capture and report, marking the device as continuously triggered
    Continuous,
    /// Stop reporting
    Stop,
}

impl TriggerMode {
    /// Every accepted trigger value
    pub const ALLOWED: [TriggerMode; 3] = [TriggerMode::Single, TriggerMode::Continuous, TriggerMode::Stop];

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Single => "single",
            TriggerMode::Continuous => "continuous",
            TriggerMode::Stop => "stop",
        }
    }

    /// Parse from the wire representation
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALLOWED.into_iter().find(|mode| mode.as_str() == s)
    }

    /// Whether writing this mode starts a capture
    pub fn starts_capture(&self) -> bool {
        !matches!(self, TriggerMode::Stop)
    }
}

/// Encoding requested from the device for captured images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// JPEG
    Jpeg,
    /// PNG
    Png,
    /// Portable anymap
    Pnm,
}

impl ImageFormat {
    /// Every supported format
    pub const ALLOWED: [ImageFormat; 3] = [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Pnm];

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Pnm => "pnm",
        }
    }

    /// Parse from the wire representation
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALLOWED.into_iter().find(|format| format.as_str() == s)
    }
}

impl Default for ImageFormat {
    fn default() -> Self {
        ImageFormat::Jpeg
    }
}

/// Capture-and-report settings of a camera-class device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureConfig {
    /// Image format requested from the device
    pub format: ImageFormat,
    /// Where captured images are posted; `None` disables reporting
    pub endpoint: Option<Url>,
    /// Last accepted trigger mode
    pub trigger: TriggerMode,
}

impl CaptureConfig {
    /// Capture settings a freshly created device starts with
    pub fn new(format: ImageFormat) -> Self {
        Self {
            format,
            endpoint: None,
            trigger: TriggerMode::Stop,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::new(ImageFormat::default())
    }
}

/// Mutable state of one device, guarded by the entry's lock
#[derive(Debug)]
pub struct DeviceRecord<H> {
    /// Open handle, if any
    pub handle: Option<H>,
    /// Feature targeted by the last merged visitor config
    pub active_feature: String,
    /// Capture settings
    pub capture: CaptureConfig,
    /// A publish pipeline is in flight
    pub publish_busy: bool,
    /// Bumped by every trigger write that takes effect. A finished upload
    /// only stores its mode if no later write happened.
    pub trigger_generation: u64,
    /// Failed reconnect attempts of the current loop
    pub retry_count: u32,
    /// Reconnect attempts before giving up
    pub max_retry: u32,
    /// Reconnect loops started over the lifetime of the record
    pub reconnect_loops: u64,
    /// Bumped each time a freshly opened handle is installed
    pub link_epoch: u64,
    /// Cancellation for the connect/reconnect task in flight, if any
    pub link_task: Option<CancellationToken>,
}

impl<H> DeviceRecord<H> {
    /// Start a new trigger generation and return it
    pub fn next_trigger_generation(&mut self) -> u64 {
        self.trigger_generation += 1;
        self.trigger_generation
    }

    /// Install a freshly opened handle, returning the one it replaces
    pub fn install_handle(&mut self, handle: H) -> Option<H> {
        self.link_epoch += 1;
        self.handle.replace(handle)
    }
}

/// Read-only copy of a device's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    /// Device identifier
    pub id: DeviceId,
    /// Connection status
    pub status: DeviceStatus,
    /// Feature targeted by the last merged visitor config
    pub active_feature: String,
    /// Capture settings
    pub capture: CaptureConfig,
    /// A publish pipeline is in flight
    pub publish_busy: bool,
    /// Failed reconnect attempts of the current loop
    pub retry_count: u32,
    /// Reconnect attempts before giving up
    pub max_retry: u32,
    /// Reconnect loops started so far
    pub reconnect_loops: u64,
}

/// One device known to the driver
#[derive(Debug)]
pub struct DeviceEntry<H> {
    id: DeviceId,
    record: Mutex<DeviceRecord<H>>,
    status: watch::Sender<DeviceStatus>,
}

impl<H> DeviceEntry<H> {
    /// Create a disconnected device
    pub fn new(id: DeviceId, capture: CaptureConfig, max_retry: u32) -> Self {
        let (status, _) = watch::channel(DeviceStatus::Disconnected);
        Self {
            id,
            record: Mutex::new(DeviceRecord {
                handle: None,
                active_feature: String::new(),
                capture,
                publish_busy: false,
                trigger_generation: 0,
                retry_count: 0,
                max_retry,
                reconnect_loops: 0,
                link_epoch: 0,
                link_task: None,
            }),
            status,
        }
    }

    /// Device identifier
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Lock the record; a poisoned lock is recovered since every writer
    /// leaves the record consistent between statements
    pub fn lock(&self) -> MutexGuard<'_, DeviceRecord<H>> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status without taking the record lock
    pub fn status(&self) -> DeviceStatus {
        *self.status.borrow()
    }

    /// Publish a new status. Callers hold the record lock so status and
    /// record change together.
    pub fn set_status(&self, _record: &DeviceRecord<H>, status: DeviceStatus) {
        self.status.send_replace(status);
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<DeviceStatus> {
        self.status.subscribe()
    }

    /// Copy the current state
    pub fn snapshot(&self) -> DeviceSnapshot {
        let record = self.lock();
        DeviceSnapshot {
            id: self.id.clone(),
            status: self.status(),
            active_feature: record.active_feature.clone(),
            capture: record.capture.clone(),
            publish_busy: record.publish_busy,
            retry_count: record.retry_count,
            max_retry: record.max_retry,
            reconnect_loops: record.reconnect_loops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_mode_parse() {
        assert_eq!(TriggerMode::parse("single"), Some(TriggerMode::Single));
        assert_eq!(TriggerMode::parse("continuous"), Some(TriggerMode::Continuous));
        assert_eq!(TriggerMode::parse("stop"), Some(TriggerMode::Stop));
        assert_eq!(TriggerMode::parse("Single"), None);
        assert!(TriggerMode::Single.starts_capture());
        assert!(!TriggerMode::Stop.starts_capture());
    }

    #[test]
    fn test_image_format_parse() {
        assert_eq!(ImageFormat::parse("png"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::parse("bmp"), None);
        assert_eq!(ImageFormat::default().as_str(), "jpeg");
    }

    #[test]
    fn test_new_entry_is_disconnected() {
        let entry: DeviceEntry<()> = DeviceEntry::new(DeviceId::from("cam-1"), CaptureConfig::default(), 100);
        let snapshot = entry.snapshot();
        assert_eq!(snapshot.status, DeviceStatus::Disconnected);
        assert_eq!(snapshot.capture.trigger, TriggerMode::Stop);
        assert_eq!(snapshot.max_retry, 100);
        assert!(!snapshot.publish_busy);
    }

    #[test]
    fn test_status_updates_are_visible_to_subscribers() {
        let entry: DeviceEntry<()> = DeviceEntry::new(DeviceId::from("cam-1"), CaptureConfig::default(), 3);
        let rx = entry.subscribe();
        {
            let record = entry.lock();
            entry.set_status(&record, DeviceStatus::Reconnecting { attempt: 2 });
        }
        assert_eq!(*rx.borrow(), DeviceStatus::Reconnecting { attempt: 2 });
        assert_eq!(entry.status().to_string(), "reconnecting (attempt 2)");
    }
}
