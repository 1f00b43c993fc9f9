/*!
 * Binding to the vendor camera library.
 *
 * The shared library is loaded once and its six entry points are resolved
 * up front; they stay valid for as long as the [`RcApiLibrary`] lives.
 * Strings handed back by the library (values and error messages) are
 * allocated with `malloc` and released here with `free`; image buffers go
 * back through the library's own `free_image`.
 */
use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::path::Path;
use std::ptr;

use libloading::Library;
use tracing::info;

use mapperflow_core::config::DriverConfig;
use mapperflow_core::types::DeviceId;

use crate::error::{DriverError, Result};
use crate::hardware::{CameraAbi, HardwareError};

type OpenDeviceFn = unsafe extern "C" fn(*mut *mut c_uint, *const c_char, *mut *mut c_char) -> c_int;
type GetValueFn = unsafe extern "C" fn(*mut c_uint, *const c_char, *mut *mut c_char, *mut *mut c_char) -> c_int;
type SetValueFn = unsafe extern "C" fn(*mut c_uint, *const c_char, *const c_char, *mut *mut c_char) -> c_int;
type GetImageFn =
    unsafe extern "C" fn(*mut c_uint, *const c_char, *mut *mut c_char, *mut c_int, *mut *mut c_char) -> c_int;
type CloseDeviceFn = unsafe extern "C" fn(*mut c_uint);
type FreeImageFn = unsafe extern "C" fn(*mut *mut c_char);

/// Open device owned by the vendor library
#[derive(Debug)]
pub struct NativeHandle(*mut c_uint);

// The library allows a handle to be used from any thread as long as calls
// on it do not overlap; the device lock serializes them.
unsafe impl Send for NativeHandle {}

/// Image buffer allocated by the vendor library
#[derive(Debug)]
pub struct NativeFrame {
    data: *mut c_char,
    len: usize,
}

// The buffer is exclusively owned until it is handed to `free_image`.
unsafe impl Send for NativeFrame {}

impl AsRef<[u8]> for NativeFrame {
    fn as_ref(&self) -> &[u8] {
        if self.data.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: the library reported `len` readable bytes at `data`, and the
        // buffer is not freed before the frame is consumed by `free`.
        unsafe { std::slice::from_raw_parts(self.data.cast::<u8>(), self.len) }
    }
}

/// The vendor camera library, loaded once
pub struct RcApiLibrary {
    open_device: OpenDeviceFn,
    get_value: GetValueFn,
    set_value: SetValueFn,
    get_image: GetImageFn,
    close_device: CloseDeviceFn,
    free_image: FreeImageFn,
    // Keeps the function pointers above valid; dropped last
    _library: Library,
}

impl RcApiLibrary {
    /// Load the library at `path` and resolve its entry points
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        // SAFETY: loading runs the library's initializers; the vendor library
        // has none with preconditions.
        let library = unsafe { Library::new(path) }
            .map_err(|e| DriverError::Library(format!("failed to load {}: {}", path.display(), e)))?;

        // SAFETY: the types match the vendor header declarations.
        let binding = unsafe {
            Self {
                open_device: symbol(&library, b"open_device\0")?,
                get_value: symbol(&library, b"get_value\0")?,
                set_value: symbol(&library, b"set_value\0")?,
                get_image: symbol(&library, b"get_image\0")?,
                close_device: symbol(&library, b"close_device\0")?,
                free_image: symbol(&library, b"free_image\0")?,
                _library: library,
            }
        };
        info!("Loaded camera library {}", path.display());
        Ok(binding)
    }

    /// Load the library named by the `driver` configuration section
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        Self::load(&config.library_path)
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T> {
    library.get::<T>(name).map(|symbol| *symbol).map_err(|e| {
        let name = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned();
        DriverError::Library(format!("missing symbol {}: {}", name, e))
    })
}

fn c_string(what: &str, text: &str) -> std::result::Result<CString, HardwareError> {
    CString::new(text).map_err(|_| HardwareError::soft(format!("{} contains a NUL byte", what)))
}

/// Copy and release a string allocated by the library
///
/// # Safety
///
/// `ptr` is null or a NUL-terminated string allocated with `malloc` that is
/// not used afterwards.
unsafe fn take_string(ptr: *mut c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let text = CStr::from_ptr(ptr).to_string_lossy().into_owned();
    libc::free(ptr.cast::<c_void>());
    text
}

fn failure(code: c_int, message: String) -> HardwareError {
    if code == 0 {
        HardwareError::hard(format!("library reported success without a result: {}", message))
    } else {
        HardwareError::from_code(code, message)
    }
}

impl CameraAbi for RcApiLibrary {
    type Handle = NativeHandle;
    type Frame = NativeFrame;

    fn open(&self, device_id: &DeviceId) -> std::result::Result<NativeHandle, HardwareError> {
        let sn = c_string("device serial number", device_id.as_str())?;
        let mut device: *mut c_uint = ptr::null_mut();
        let mut error: *mut c_char = ptr::null_mut();

        // SAFETY: every pointer is valid for the duration of the call.
        let (code, message) = unsafe {
            let code = (self.open_device)(&mut device, sn.as_ptr(), &mut error);
            (code, take_string(error))
        };
        if code != 0 || device.is_null() {
            return Err(failure(code, message));
        }
        Ok(NativeHandle(device))
    }

    fn get(&self, handle: &NativeHandle, feature: &str) -> std::result::Result<String, HardwareError> {
        let feature = c_string("feature name", feature)?;
        let mut value: *mut c_char = ptr::null_mut();
        let mut error: *mut c_char = ptr::null_mut();

        // SAFETY: the handle is open and every pointer is valid for the call.
        let (code, value, message) = unsafe {
            let code = (self.get_value)(handle.0, feature.as_ptr(), &mut value, &mut error);
            (code, take_string(value), take_string(error))
        };
        if code != 0 {
            return Err(failure(code, message));
        }
        Ok(value)
    }

    fn set(&self, handle: &NativeHandle, feature: &str, value: &str) -> std::result::Result<(), HardwareError> {
        let feature = c_string("feature name", feature)?;
        let value = c_string("feature value", value)?;
        let mut error: *mut c_char = ptr::null_mut();

        // SAFETY: the handle is open and every pointer is valid for the call.
        let (code, message) = unsafe {
            let code = (self.set_value)(handle.0, feature.as_ptr(), value.as_ptr(), &mut error);
            (code, take_string(error))
        };
        if code != 0 {
            return Err(failure(code, message));
        }
        Ok(())
    }

    fn get_image(&self, handle: &NativeHandle, format: &str) -> std::result::Result<NativeFrame, HardwareError> {
        let format = c_string("image format", format)?;
        let mut data: *mut c_char = ptr::null_mut();
        let mut size: c_int = 0;
        let mut error: *mut c_char = ptr::null_mut();

        // SAFETY: the handle is open and every pointer is valid for the call.
        let (code, message) = unsafe {
            let code = (self.get_image)(handle.0, format.as_ptr(), &mut data, &mut size, &mut error);
            (code, take_string(error))
        };
        let frame = NativeFrame {
            data,
            len: usize::try_from(size).unwrap_or(0),
        };
        if code != 0 {
            self.free(frame);
            return Err(failure(code, message));
        }
        Ok(frame)
    }

    fn close(&self, handle: NativeHandle) {
        // SAFETY: the handle came from `open_device` and is consumed here.
        unsafe { (self.close_device)(handle.0) }
    }

    fn free(&self, mut frame: NativeFrame) {
        if frame.data.is_null() {
            return;
        }
        // SAFETY: the buffer came from `get_image` and is consumed here.
        unsafe { (self.free_image)(&mut frame.data) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library() {
        let err = RcApiLibrary::load("/nonexistent/librcapi.so").err().unwrap();
        assert!(matches!(err, DriverError::Library(msg) if msg.contains("/nonexistent/librcapi.so")));
    }

    #[test]
    fn test_empty_frame_is_empty_slice() {
        let frame = NativeFrame {
            data: ptr::null_mut(),
            len: 16,
        };
        assert!(frame.as_ref().is_empty());
    }

    #[test]
    fn test_failure_with_success_code_is_hard() {
        assert!(failure(0, String::new()).is_hard());
        assert!(!failure(1, "busy".to_string()).is_hard());
        assert!(!failure(-1, "out of memory".to_string()).is_hard());
    }
}
