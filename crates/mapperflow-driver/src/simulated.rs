/*!
 * In-memory camera implementing [`CameraAbi`].
 *
 * The simulated camera keeps a feature table and an image payload per
 * device, and lets callers script failures. It backs hardware-less runs
 * and the test-suite; call counters make resource handling observable.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mapperflow_core::types::DeviceId;

use crate::hardware::{CameraAbi, HardwareError};

/// Number of calls made through each entry point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `open` calls
    pub open: usize,
    /// `get` calls
    pub get: usize,
    /// `set` calls
    pub set: usize,
    /// `get_image` calls
    pub get_image: usize,
    /// `close` calls
    pub close: usize,
    /// `free` calls
    pub free: usize,
}

/// Open connection to a simulated device
#[derive(Debug)]
pub struct SimHandle {
    device: DeviceId,
}

/// Image buffer handed out by the simulated camera
#[derive(Debug)]
pub struct SimFrame(Vec<u8>);

impl AsRef<[u8]> for SimFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Default)]
struct SimDevice {
    features: HashMap<String, String>,
    frame: Vec<u8>,
    open_handles: usize,
    open_failures: u32,
    call_failures: VecDeque<HardwareError>,
}

#[derive(Debug, Default)]
struct SimState {
    devices: HashMap<DeviceId, SimDevice>,
    calls: CallCounts,
}

/// A camera living in memory
#[derive(Debug, Default)]
pub struct SimulatedCamera {
    state: Mutex<SimState>,
}

impl SimulatedCamera {
    /// Create a camera with no devices attached
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a device
    pub fn add_device<I: Into<DeviceId>>(&self, id: I) {
        self.lock().devices.entry(id.into()).or_default();
    }

    /// Detach a device; later opens fail with a hard error
    pub fn remove_device<I: Into<DeviceId>>(&self, id: I) {
        self.lock().devices.remove(&id.into());
    }

    /// Set a feature value as the device would report it
    pub fn set_feature<I: Into<DeviceId>>(&self, id: I, feature: &str, value: &str) {
        self.lock()
            .devices
            .entry(id.into())
            .or_default()
            .features
            .insert(feature.to_string(), value.to_string());
    }

    /// Current value of a device feature
    pub fn feature<I: Into<DeviceId>>(&self, id: I, feature: &str) -> Option<String> {
        self.lock()
            .devices
            .get(&id.into())
            .and_then(|d| d.features.get(feature).cloned())
    }

    /// Set the payload returned by `get_image`
    pub fn set_frame<I: Into<DeviceId>>(&self, id: I, frame: Vec<u8>) {
        self.lock().devices.entry(id.into()).or_default().frame = frame;
    }

    /// Make the next `count` opens of a device fail with a hard error
    pub fn fail_next_opens<I: Into<DeviceId>>(&self, id: I, count: u32) {
        self.lock().devices.entry(id.into()).or_default().open_failures = count;
    }

    /// Queue a failure for the next get/set/get_image call on a device
    pub fn fail_next_call<I: Into<DeviceId>>(&self, id: I, code: i32, message: &str) {
        self.lock()
            .devices
            .entry(id.into())
            .or_default()
            .call_failures
            .push_back(HardwareError::from_code(code, message));
    }

    /// Number of handles currently open for a device
    pub fn open_handles<I: Into<DeviceId>>(&self, id: I) -> usize {
        self.lock()
            .devices
            .get(&id.into())
            .map_or(0, |d| d.open_handles)
    }

    /// Call counters
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    fn with_device<T>(
        &self,
        handle: &SimHandle,
        f: impl FnOnce(&mut SimDevice) -> Result<T, HardwareError>,
    ) -> Result<T, HardwareError> {
        let mut state = self.lock();
        let device = state
            .devices
            .get_mut(&handle.device)
            .ok_or_else(|| HardwareError::hard(format!("device {} detached", handle.device)))?;
        if let Some(failure) = device.call_failures.pop_front() {
            return Err(failure);
        }
        f(device)
    }
}

impl CameraAbi for SimulatedCamera {
    type Handle = SimHandle;
    type Frame = SimFrame;

    fn open(&self, device_id: &DeviceId) -> Result<SimHandle, HardwareError> {
        let mut state = self.lock();
        state.calls.open += 1;
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| HardwareError::hard(format!("Cannot find device: {}", device_id)))?;
        if device.open_failures > 0 {
            device.open_failures -= 1;
            return Err(HardwareError::hard(format!("Cannot find device: {}", device_id)));
        }
        device.open_handles += 1;
        Ok(SimHandle {
            device: device_id.clone(),
        })
    }

    fn get(&self, handle: &SimHandle, feature: &str) -> Result<String, HardwareError> {
        self.lock().calls.get += 1;
        self.with_device(handle, |device| {
            device
                .features
                .get(feature)
                .cloned()
                .ok_or_else(|| HardwareError::soft(format!("feature {} not found", feature)))
        })
    }

    fn set(&self, handle: &SimHandle, feature: &str, value: &str) -> Result<(), HardwareError> {
        self.lock().calls.set += 1;
        self.with_device(handle, |device| {
            device
                .features
                .insert(feature.to_string(), value.to_string());
            Ok(())
        })
    }

    fn get_image(&self, handle: &SimHandle, _format: &str) -> Result<SimFrame, HardwareError> {
        self.lock().calls.get_image += 1;
        self.with_device(handle, |device| {
            if device.frame.is_empty() {
                return Err(HardwareError::soft("no images"));
            }
            Ok(SimFrame(device.frame.clone()))
        })
    }

    fn close(&self, handle: SimHandle) {
        let mut state = self.lock();
        state.calls.close += 1;
        if let Some(device) = state.devices.get_mut(&handle.device) {
            device.open_handles = device.open_handles.saturating_sub(1);
        }
    }

    fn free(&self, _frame: SimFrame) {
        self.lock().calls.free += 1;
    }
}
