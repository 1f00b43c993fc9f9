/*!
 * Hardware ABI abstraction.
 *
 * Every camera-class driver talks to its device through the six entry
 * points of [`CameraAbi`]. Each call reports a [`Signal`] that decides
 * whether a failure is only returned to the caller or also takes the
 * device link down.
 */
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};

use mapperflow_core::types::DeviceId;

/// Severity of a hardware call outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// The call succeeded
    Ok,
    /// Transient failure, reported to the caller only
    Soft,
    /// Link-level failure, the device has to be reopened
    Hard,
}

impl Signal {
    /// Classify a raw status code returned by a vendor library.
    ///
    /// `0` is success, `1` a soft failure and anything above `1` a hard
    /// failure. Negative codes come from allocation failures inside the
    /// library and are treated as soft.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Signal::Ok,
            c if c > 1 => Signal::Hard,
            _ => Signal::Soft,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Ok => "ok",
            Signal::Soft => "soft",
            Signal::Hard => "hard",
        })
    }
}

/// Failure reported by a hardware call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (signal {signal})")]
pub struct HardwareError {
    /// Severity of the failure
    pub signal: Signal,
    /// Message reported by the device library
    pub message: String,
}

impl HardwareError {
    /// Create an error from a raw status code and message
    pub fn from_code<S: Into<String>>(code: i32, message: S) -> Self {
        Self {
            signal: Signal::from_code(code),
            message: message.into(),
        }
    }

    /// Create a soft failure
    pub fn soft<S: Into<String>>(message: S) -> Self {
        Self {
            signal: Signal::Soft,
            message: message.into(),
        }
    }

    /// Create a hard failure
    pub fn hard<S: Into<String>>(message: S) -> Self {
        Self {
            signal: Signal::Hard,
            message: message.into(),
        }
    }

    /// Whether the failure takes the link down
    pub fn is_hard(&self) -> bool {
        self.signal == Signal::Hard
    }
}

/// The native entry points a camera-class device exposes
///
/// Implementations are shared between the caller's task and background
/// reconnect/publish tasks, so calls must be safe to issue from any thread.
/// A handle is only ever used by one call at a time.
pub trait CameraAbi: Send + Sync + 'static {
    /// Open connection to a device
    type Handle: Send + 'static;

    /// Image buffer owned by the device library
    type Frame: AsRef<[u8]> + Send + 'static;

    /// Open the device with the given identifier
    fn open(&self, device_id: &DeviceId) -> Result<Self::Handle, HardwareError>;

    /// Read a feature as text
    fn get(&self, handle: &Self::Handle, feature: &str) -> Result<String, HardwareError>;

    /// Write a feature from its text representation
    fn set(&self, handle: &Self::Handle, feature: &str, value: &str) -> Result<(), HardwareError>;

    /// Grab one image encoded in `format`
    fn get_image(&self, handle: &Self::Handle, format: &str) -> Result<Self::Frame, HardwareError>;

    /// Close a handle
    fn close(&self, handle: Self::Handle);

    /// Release an image buffer
    fn free(&self, frame: Self::Frame);
}

/// An image buffer that is handed back to the device library when dropped
pub struct ForeignFrame<A: CameraAbi> {
    abi: Arc<A>,
    frame: Option<A::Frame>,
}

impl<A: CameraAbi> ForeignFrame<A> {
    /// Take ownership of a frame returned by `abi`
    pub fn new(abi: Arc<A>, frame: A::Frame) -> Self {
        Self {
            abi,
            frame: Some(frame),
        }
    }

    /// The frame contents
    pub fn bytes(&self) -> &[u8] {
        self.frame.as_ref().map(AsRef::as_ref).unwrap_or(&[])
    }

    /// Length of the frame in bytes
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Whether the frame is empty
    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

impl<A: CameraAbi> fmt::Debug for ForeignFrame<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignFrame")
            .field("len", &self.len())
            .finish()
    }
}

impl<A: CameraAbi> Drop for ForeignFrame<A> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.abi.free(frame);
        }
    }
}

/// Open a device on the blocking pool; vendor open calls can take seconds
pub(crate) async fn open_blocking<A: CameraAbi>(
    abi: &Arc<A>,
    device_id: &DeviceId,
) -> Result<A::Handle, HardwareError> {
    let abi = Arc::clone(abi);
    let id = device_id.clone();
    tokio::task::spawn_blocking(move || abi.open(&id))
        .await
        .unwrap_or_else(|e| Err(HardwareError::soft(format!("open task failed: {}", e))))
}

/// Run a vendor call that may block while the device lock is held.
///
/// On a multi-threaded runtime the worker hands its queued tasks to another
/// thread first. A current-thread runtime cannot do that, so the call runs
/// inline there.
pub(crate) fn call_blocking<R>(call: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(runtime) if runtime.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(call)
        }
        _ => call(),
    }
}
