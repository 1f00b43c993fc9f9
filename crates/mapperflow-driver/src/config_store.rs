/*!
 * Configuration store.
 *
 * A mapper call carries up to three JSON blobs (common, visitor and
 * protocol config). Each present blob is merged field-by-field into the
 * previously applied one; absent blobs leave their part unchanged. The
 * three parts are decoded on copies and swapped in together, so a failure
 * in any blob leaves the store exactly as it was.
 */
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error};

use mapperflow_core::types::DeviceId;

use crate::error::{ConfigPart, DriverError, Result};

/// Connection-level settings shared by all features of a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Vendor-customized values
    #[serde(rename = "customizedValues", default)]
    pub customized_values: CommonCustomizedValues,
}

/// Customized values of the common config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonCustomizedValues {
    /// Serial number of the device the call targets
    #[serde(rename = "deviceSN", default)]
    pub device_sn: String,
}

/// Per-feature access descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorConfig {
    /// Protocol the visitor belongs to
    #[serde(rename = "protocolName", default)]
    pub protocol_name: String,
    /// Feature addressing
    #[serde(rename = "configData", default)]
    pub config_data: VisitorConfigData,
}

/// Feature addressing of a visitor config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorConfigData {
    /// Name of the targeted feature
    #[serde(rename = "FeatureName", default)]
    pub feature_name: String,
}

/// Protocol-specific settings, kept opaque
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Protocol name
    #[serde(rename = "protocolName", default)]
    pub protocol_name: String,
    /// Protocol-specific data
    #[serde(rename = "configData", default)]
    pub config_data: Map<String, JsonValue>,
}

/// A fully merged view of the three configuration parts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSnapshot {
    /// Common config
    pub common: CommonConfig,
    /// Visitor config
    pub visitor: VisitorConfig,
    /// Protocol config
    pub protocol: ProtocolConfig,
}

impl ConfigSnapshot {
    /// The device the common config targets
    pub fn device_id(&self) -> Result<DeviceId> {
        let sn = self.common.customized_values.device_sn.trim();
        if sn.is_empty() {
            return Err(DriverError::MissingDeviceId);
        }
        Ok(DeviceId::new(sn))
    }

    /// The feature the visitor config targets
    pub fn feature_name(&self) -> &str {
        &self.visitor.config_data.feature_name
    }
}

/// Holds the current configuration and applies updates atomically
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: Mutex<Arc<ConfigSnapshot>>,
}

impl ConfigStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// The last applied configuration
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Merge the present blobs into the current configuration.
    ///
    /// Returns the snapshot this call produced; callers dispatch against it
    /// rather than re-reading the store, so concurrent merges cannot leak
    /// into each other's calls.
    pub fn merge(
        &self,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> Result<Arc<ConfigSnapshot>> {
        self.merge_with(common, visitor, protocol, |_| ())
            .map(|(snapshot, ())| snapshot)
    }

    /// Merge like [`merge`](Self::merge), then run `apply` on the result
    /// before the store lock is released.
    ///
    /// State derived from the configuration is updated in `apply`, so it
    /// changes in the same order as the merges themselves. `apply` may take
    /// device locks but must not call back into the store.
    pub fn merge_with<R>(
        &self,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
        apply: impl FnOnce(&Arc<ConfigSnapshot>) -> R,
    ) -> Result<(Arc<ConfigSnapshot>, R)> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(next) = merged(&current, common, visitor, protocol)? {
            if next != **current {
                debug!(
                    device = %next.common.customized_values.device_sn,
                    feature = %next.feature_name(),
                    "Configuration updated"
                );
                *current = Arc::new(next);
            }
        }
        let snapshot = Arc::clone(&current);
        let derived = apply(&snapshot);
        Ok((snapshot, derived))
    }

    /// Decode the blobs against the current configuration without storing
    /// the result
    pub fn preview(
        &self,
        common: Option<&[u8]>,
        visitor: Option<&[u8]>,
        protocol: Option<&[u8]>,
    ) -> Result<Arc<ConfigSnapshot>> {
        let current = self.snapshot();
        Ok(match merged(&current, common, visitor, protocol)? {
            Some(next) => Arc::new(next),
            None => current,
        })
    }
}

/// The configuration after applying the blobs, or `None` when there are none
fn merged(
    current: &ConfigSnapshot,
    common: Option<&[u8]>,
    visitor: Option<&[u8]>,
    protocol: Option<&[u8]>,
) -> Result<Option<ConfigSnapshot>> {
    if common.is_none() && visitor.is_none() && protocol.is_none() {
        return Ok(None);
    }
    Ok(Some(ConfigSnapshot {
        common: merge_part(&current.common, common, ConfigPart::Common)?,
        visitor: merge_part(&current.visitor, visitor, ConfigPart::Visitor)?,
        protocol: merge_part(&current.protocol, protocol, ConfigPart::Protocol)?,
    }))
}

fn merge_part<T>(base: &T, blob: Option<&[u8]>, which: ConfigPart) -> Result<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    let Some(blob) = blob else {
        return Ok(base.clone());
    };

    let decode_err = |e: serde_json::Error| {
        error!("Unmarshal {} config error: {}", which, e);
        DriverError::Decode {
            which,
            message: e.to_string(),
        }
    };

    let patch: JsonValue = serde_json::from_slice(blob).map_err(decode_err)?;
    let mut merged = serde_json::to_value(base).map_err(decode_err)?;
    merge_json(&mut merged, patch);
    serde_json::from_value(merged).map_err(decode_err)
}

/// Overlay `patch` onto `base`: objects merge key by key, `null` leaves the
/// base untouched, anything else replaces it
fn merge_json(base: &mut JsonValue, patch: JsonValue) {
    match (base, patch) {
        (_, JsonValue::Null) => {}
        (JsonValue::Object(base), JsonValue::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        if !value.is_null() {
                            base.insert(key, value);
                        }
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
