/*!
 * Device client.
 *
 * [`DeviceClient`] is the camera-class implementation of the mapper
 * lifecycle. It owns the device registry and the configuration store and
 * wires the feature dispatcher, the reconnect supervisor and the capture
 * publisher together. Records are created on the first call that names a
 * device and live as long as the client.
 */
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use mapperflow_core::config::DriverConfig;
use mapperflow_core::error::Error as CoreError;
use mapperflow_core::types::{DeviceId, Value};

use crate::config_store::{ConfigSnapshot, ConfigStore};
use crate::device::{CaptureConfig, DeviceEntry, DeviceSnapshot, DeviceStatus, ImageFormat};
use crate::driver::ProtocolDriver;
use crate::error::{DriverError, Result};
use crate::feature::FeatureDispatcher;
use crate::hardware::CameraAbi;
use crate::publisher::AsyncPublisher;
use crate::reconnect::ReconnectSupervisor;
use crate::registry::DeviceRegistry;

type Entry<A> = Arc<DeviceEntry<<A as CameraAbi>::Handle>>;

/// Protocol name reported by camera-class clients
pub const PROTOCOL_NAME: &str = "GigEVision";

/// Runtime settings of a device client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSettings {
    /// Delay before each reconnect attempt
    pub reconnect_interval: Duration,
    /// Reconnect attempts a new device starts with
    pub max_retry: u32,
    /// Deadline of one image upload
    pub publish_timeout: Duration,
    /// Image format a new device starts with
    pub image_format: ImageFormat,
}

impl DriverSettings {
    /// Derive settings from the `driver` configuration section
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        let format = config.default_image_format.trim();
        let image_format = ImageFormat::parse(format).ok_or_else(|| {
            CoreError::config(format!("unsupported default image format: {}", format))
        })?;
        Ok(Self {
            reconnect_interval: config.reconnect_interval(),
            max_retry: config.max_retry_times,
            publish_timeout: config.publish_timeout(),
            image_format,
        })
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        let config = DriverConfig::default();
        Self {
            reconnect_interval: config.reconnect_interval(),
            max_retry: config.max_retry_times,
            publish_timeout: config.publish_timeout(),
            image_format: ImageFormat::default(),
        }
    }
}

/// Camera-class driver serving any number of devices
pub struct DeviceClient<A: CameraAbi> {
    registry: DeviceRegistry<A::Handle>,
    config: ConfigStore,
    dispatcher: FeatureDispatcher<A>,
    settings: DriverSettings,
}

impl<A: CameraAbi> DeviceClient<A> {
    /// Create a client talking to devices through `abi`
    pub fn new(abi: Arc<A>, settings: DriverSettings) -> Self {
        Self::with_http_client(abi, settings, reqwest::Client::new())
    }

    /// Create a client that uploads images with the given HTTP client
    pub fn with_http_client(abi: Arc<A>, settings: DriverSettings, http: reqwest::Client) -> Self {
        let supervisor = ReconnectSupervisor::new(Arc::clone(&abi), settings.reconnect_interval);
        let publisher = AsyncPublisher::new(Arc::clone(&abi), http, settings.publish_timeout);
        Self {
            registry: DeviceRegistry::new(),
            config: ConfigStore::new(),
            dispatcher: FeatureDispatcher::new(abi, supervisor, publisher),
            settings,
        }
    }

    /// Settings the client was created with
    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// The last merged configuration
    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.config.snapshot()
    }

    /// IDs of every device the client knows, sorted
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.registry.ids()
    }

    /// Current status of a device
    pub fn status(&self, id: &DeviceId) -> Option<DeviceStatus> {
        self.registry.get(id).ok().map(|entry| entry.status())
    }

    /// Read-only copy of a device's record
    pub fn snapshot(&self, id: &DeviceId) -> Option<DeviceSnapshot> {
        self.registry.get(id).ok().map(|entry| entry.snapshot())
    }

    /// Watch the status of a device
    pub fn subscribe(&self, id: &DeviceId) -> Result<watch::Receiver<DeviceStatus>> {
        Ok(self.registry.get(id)?.subscribe())
    }

    /// Disconnect one device: stop its reconnect loop and close its handle
    pub fn stop(&self, id: &DeviceId) -> Result<()> {
        let entry = self.registry.get(id)?;
        self.dispatcher.supervisor().stop(&entry);
        Ok(())
    }

    fn entry(&self, id: &DeviceId) -> Entry<A> {
        let (entry, created) = self.registry.get_or_insert_with(id, || {
            DeviceEntry::new(
                id.clone(),
                CaptureConfig::new(self.settings.image_format),
                self.settings.max_retry,
            )
        });
        if created {
            info!("Device {} registered", id);
        }
        entry
    }

    /// Resolve the device a snapshot targets and record its active feature
    fn target(&self, snapshot: &ConfigSnapshot) -> Result<Entry<A>> {
        let entry = self.entry(&snapshot.device_id()?);
        entry.lock().active_feature = snapshot.feature_name().to_string();
        Ok(entry)
    }

    /// Merge the blobs and target the resulting device before the store is
    /// unlocked, so active features follow the order of the merges
    fn merge_and_target(
        &self,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> Result<(Arc<ConfigSnapshot>, Result<Entry<A>>)> {
        self.config
            .merge_with(common, visitor, protocol, |snapshot| self.target(snapshot))
    }
}

#[async_trait]
impl<A: CameraAbi> ProtocolDriver for DeviceClient<A> {
    fn protocol_name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    async fn init_device(&self, common: Option<&[u8]>) -> Result<()> {
        let snapshot = self.config.merge(common, None, None)?;
        let entry = self.entry(&snapshot.device_id()?);
        let status = self.dispatcher.supervisor().connect(&entry).await;
        debug!("Device {} initialized, status {}", entry.id(), status);
        Ok(())
    }

    async fn set_config(
        &self,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> Result<()> {
        let (_, target) = self.merge_and_target(common, visitor, protocol)?;
        match target {
            Ok(_) => Ok(()),
            Err(DriverError::MissingDeviceId) => {
                debug!("Configuration merged before any device was named");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_device_data(
        &self,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> Result<Value> {
        let (snapshot, target) = self.merge_and_target(common, visitor, protocol)?;
        let entry = target?;
        self.dispatcher.read(&entry, snapshot.feature_name())
    }

    async fn write_device_data(
        &self,
        value: Value,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> Result<()> {
        let (snapshot, target) = self.merge_and_target(common, visitor, protocol)?;
        let entry = target?;
        self.dispatcher.write(&entry, snapshot.feature_name(), &value)
    }

    async fn get_device_status(
        &self,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> bool {
        // A status query never changes the stored configuration
        let Ok(snapshot) = self.config.preview(common, visitor, protocol) else {
            return false;
        };
        let Ok(id) = snapshot.device_id() else {
            return false;
        };
        self.status(&id).is_some_and(|status| status.is_connected())
    }

    async fn stop_device(&self) -> Result<()> {
        let entries = self.registry.entries();
        for entry in &entries {
            self.dispatcher.supervisor().stop(entry);
        }
        info!("Stopped {} device(s)", entries.len());
        Ok(())
    }
}
