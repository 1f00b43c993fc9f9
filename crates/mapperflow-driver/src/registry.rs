/*!
 * Device registry for a driver.
 *
 * The registry maps device identifiers to their entries. Entries are
 * created on first reference and live as long as the driver.
 */
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use mapperflow_core::types::DeviceId;

use crate::device::DeviceEntry;
use crate::error::{DriverError, Result};

/// Device registry keyed by device identifier
#[derive(Debug)]
pub struct DeviceRegistry<H> {
    devices: RwLock<HashMap<DeviceId, Arc<DeviceEntry<H>>>>,
}

impl<H> DeviceRegistry<H> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Get a device by ID
    pub fn get(&self, id: &DeviceId) -> Result<Arc<DeviceEntry<H>>> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices
            .get(id)
            .cloned()
            .ok_or_else(|| DriverError::UnknownDevice(id.clone()))
    }

    /// Get a device, creating its entry with `create` on first reference.
    ///
    /// Returns the entry and whether it was created by this call.
    pub fn get_or_insert_with<F>(&self, id: &DeviceId, create: F) -> (Arc<DeviceEntry<H>>, bool)
    where
        F: FnOnce() -> DeviceEntry<H>,
    {
        if let Ok(entry) = self.get(id) {
            return (entry, false);
        }

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have inserted between the two locks
        if let Some(entry) = devices.get(id) {
            return (Arc::clone(entry), false);
        }
        let entry = Arc::new(create());
        devices.insert(id.clone(), Arc::clone(&entry));
        debug!("Registered device {}", id);
        (entry, true)
    }

    /// All registered entries
    pub fn entries(&self) -> Vec<Arc<DeviceEntry<H>>> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.values().cloned().collect()
    }

    /// All registered device IDs, sorted
    pub fn ids(&self) -> Vec<DeviceId> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<DeviceId> = devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Count registered devices
    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no device is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H> Default for DeviceRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
