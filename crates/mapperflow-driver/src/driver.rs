/*!
 * Mapper lifecycle contract.
 *
 * Every protocol driver is driven by the platform through the six calls of
 * [`ProtocolDriver`]. Each call carries the raw configuration blobs; a
 * missing blob means "keep what was applied before".
 */
use async_trait::async_trait;

use mapperflow_core::types::Value;

use crate::error::Result;

/// Lifecycle contract consumed by the platform layer
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// Get the protocol name
    fn protocol_name(&self) -> &'static str;

    /// Register the device named by the common config and open it.
    ///
    /// A failed open is not an error: the device is left disconnected and
    /// reconnected in the background.
    async fn init_device(&self, common: Option<&[u8]>) -> Result<()>;

    /// Merge configuration blobs
    async fn set_config(
        &self,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> Result<()>;

    /// Read the feature the visitor config targets
    async fn read_device_data(
        &self,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> Result<Value>;

    /// Write the feature the visitor config targets
    async fn write_device_data(
        &self,
        value: Value,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> Result<()>;

    /// Whether the device is connected; any config error reads as `false`
    async fn get_device_status(
        &self,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> bool;

    /// Disconnect every device
    async fn stop_device(&self) -> Result<()>;
}
