/*!
 * MapperFlow Driver
 *
 * Driver core shared by protocol-specific mappers: a per-device client that
 * merges configuration, dispatches feature reads and writes, supervises
 * reconnection and runs capture-and-report pipelines.
 */

#![warn(missing_docs)]

pub mod client;
pub mod config_store;
pub mod device;
pub mod driver;
pub mod error;
pub mod feature;
pub mod hardware;
pub mod publisher;
pub mod reconnect;
pub mod registry;
pub mod simulated;

#[cfg(feature = "native")]
pub mod native;

pub use client::{DeviceClient, DriverSettings};
pub use config_store::{ConfigSnapshot, ConfigStore};
pub use device::{CaptureConfig, DeviceSnapshot, DeviceStatus, ImageFormat, TriggerMode};
pub use driver::ProtocolDriver;
pub use error::{ConfigPart, DriverError, Result};
pub use feature::{FeatureDispatcher, VirtualFeature};
pub use hardware::{CameraAbi, HardwareError, Signal};
pub use publisher::{AsyncPublisher, PublishOutcome};
pub use reconnect::ReconnectSupervisor;
pub use simulated::SimulatedCamera;

#[cfg(feature = "native")]
pub use native::RcApiLibrary;

/// MapperFlow driver crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
