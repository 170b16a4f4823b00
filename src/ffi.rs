//! C FFI layer for kinect-bridge.
//!
//! Provides an opaque handle-based API for C/C++ consumers. Frame callbacks
//! are plain function pointers carried in a [`KbCallbacks`] struct.
//! The generated C header is written to `include/kinect_bridge.h` by cbindgen.
//!
//! Status codes: `KB_OK` on success, the hardware library's (negative) code
//! for device and hardware failures, a negative `KB_ERR_*` constant otherwise.
//! The two ranges overlap: libfreenect reports most failures as `-1`, which
//! equals `KB_ERR_INIT`. Use `kb_last_error()` to tell them apart. A hardware
//! failure carrying a non-negative code is reported as `KB_ERR_INTERNAL`.

use crate::error::{LastError, KB_ERR_INVALID_ARGUMENT, KB_OK};
use crate::host::{HostRuntime, RustHost};
use crate::types::{LogLevel, StreamKind};
use crate::{BridgeConfig, DriverHandle, Result};
use std::ffi::{c_char, c_int, c_void};

thread_local! {
    /// Last error message for C consumers, per calling thread.
    static LAST_ERROR: LastError = const { LastError::new() };
}

#[cfg(feature = "libfreenect")]
type FfiBackend = crate::freenect::Freenect;
#[cfg(not(feature = "libfreenect"))]
type FfiBackend = crate::sim::SimulatedBackend;

/// Frame callback: `(user_data, frame, frame_len)`. The frame pointer is only
/// valid for the duration of the call.
pub type KbFrameFn = unsafe extern "C" fn(*mut c_void, *const u8, usize);

/// Callback object bound to an open device. A null entry fails the open.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct KbCallbacks {
    pub user_data: *mut c_void,
    pub video_callback: Option<KbFrameFn>,
    pub depth_callback: Option<KbFrameFn>,
}

// The caller guarantees `user_data` may be used from the capture thread.
unsafe impl Send for KbCallbacks {}

/// Tilt unit state in C-compatible layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct KbTiltState {
    /// Raw accelerometer counts [x, y, z].
    pub accelerometer: [i16; 3],
    /// Accelerometer [x, y, z] in m/s^2.
    pub accelerometer_mks: [f64; 3],
    /// Tilt angle in degrees.
    pub tilt_degrees: f64,
    /// 0 = stopped, 1 = at limit, 4 = moving.
    pub status: c_int,
}

/// Host runtime for C consumers: callbacks are function pointers, frame
/// buffers are owned byte vectors.
pub struct FfiHost;

impl HostRuntime for FfiHost {
    type Object = KbCallbacks;
    type Method = KbFrameFn;
    type ByteArray = Vec<u8>;

    fn attach_current_thread(&self, name: &str) -> Result<()> {
        log::debug!("C host: capture thread {} attached", name);
        Ok(())
    }

    fn detach_current_thread(&self) {}

    fn resolve_callback(&self, object: &KbCallbacks, stream: StreamKind) -> Option<KbFrameFn> {
        match stream {
            StreamKind::Video => object.video_callback,
            StreamKind::Depth => object.depth_callback,
        }
    }

    fn new_byte_array(&self, len: usize) -> Result<Vec<u8>> {
        RustHost.new_byte_array(len)
    }

    fn set_byte_array_region(&self, array: &mut Vec<u8>, data: &[u8]) {
        RustHost.set_byte_array_region(array, data);
    }

    fn call_callback(&self, object: &KbCallbacks, method: KbFrameFn, array: &Vec<u8>) -> Result<()> {
        unsafe { method(object.user_data, array.as_ptr(), array.len()) };
        Ok(())
    }
}

/// Opaque driver handle for C consumers.
pub struct KbDriver(DriverHandle<FfiBackend, FfiHost>);

fn new_backend() -> Result<FfiBackend> {
    #[cfg(feature = "libfreenect")]
    {
        crate::freenect::Freenect::new()
    }
    #[cfg(not(feature = "libfreenect"))]
    {
        Ok(crate::sim::SimulatedBackend::new(BridgeConfig::simulated_devices()))
    }
}

fn status(result: Result<()>) -> c_int {
    match result {
        Ok(()) => KB_OK,
        Err(e) => {
            LAST_ERROR.with(|last| last.set(&e));
            e.code()
        }
    }
}

/// Negative indices map to an index no table can hold.
fn device_index(index: c_int) -> usize {
    usize::try_from(index).unwrap_or(usize::MAX)
}

unsafe fn with_driver(
    driver: *const KbDriver,
    f: impl FnOnce(&DriverHandle<FfiBackend, FfiHost>) -> Result<()>,
) -> c_int {
    match driver.as_ref() {
        Some(driver) => status(f(&driver.0)),
        None => KB_ERR_INVALID_ARGUMENT,
    }
}

/// Initialize the driver and start the capture thread.
/// Settings come from `KINECT_BRIDGE_*` environment variables.
/// Returns NULL on error (check kb_last_error()).
#[no_mangle]
pub extern "C" fn kb_init() -> *mut KbDriver {
    let config = BridgeConfig::from_env();
    match new_backend().and_then(|backend| DriverHandle::init_with_config(backend, FfiHost, &config)) {
        Ok(driver) => Box::into_raw(Box::new(KbDriver(driver))),
        Err(e) => {
            LAST_ERROR.with(|last| last.set(&e));
            std::ptr::null_mut()
        }
    }
}

/// Stop the capture thread, close any open devices and free the driver.
///
/// # Safety
/// `driver` must be a pointer returned by `kb_init`, or null. It must not be
/// called from inside a frame callback.
#[no_mangle]
pub unsafe extern "C" fn kb_shutdown(driver: *mut KbDriver) {
    if !driver.is_null() {
        Box::from_raw(driver).0.shutdown();
    }
}

/// Number of devices enumerated at init, or a negative status code.
///
/// # Safety
/// `driver` must be a valid driver pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kb_device_count(driver: *const KbDriver) -> c_int {
    match driver.as_ref() {
        Some(driver) => c_int::try_from(driver.0.device_count()).unwrap_or(c_int::MAX),
        None => KB_ERR_INVALID_ARGUMENT,
    }
}

/// Set the hardware library log level (0 = fatal .. 7 = flood).
///
/// # Safety
/// `driver` must be a valid driver pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kb_set_log_level(driver: *const KbDriver, level: c_int) -> c_int {
    with_driver(driver, |d| {
        d.set_log_level(LogLevel::try_from(level)?);
        Ok(())
    })
}

/// Open device `index` and bind `callbacks` to it. Both callback entries
/// must be non-null.
///
/// # Safety
/// `driver` must be a valid driver pointer, or null. `callbacks` must point
/// to a valid `KbCallbacks`, or be null.
#[no_mangle]
pub unsafe extern "C" fn kb_open(
    driver: *const KbDriver,
    index: c_int,
    callbacks: *const KbCallbacks,
) -> c_int {
    let Some(callbacks) = callbacks.as_ref() else {
        return KB_ERR_INVALID_ARGUMENT;
    };
    with_driver(driver, |d| d.open(device_index(index), *callbacks))
}

/// Close device `index`, stopping its streams first.
///
/// # Safety
/// `driver` must be a valid driver pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kb_close(driver: *const KbDriver, index: c_int) -> c_int {
    with_driver(driver, |d| d.close(device_index(index)))
}

/// Start the 640x480 RGB stream of device `index`.
///
/// # Safety
/// `driver` must be a valid driver pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kb_start_video(driver: *const KbDriver, index: c_int) -> c_int {
    with_driver(driver, |d| d.start_video(device_index(index)))
}

/// # Safety
/// `driver` must be a valid driver pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kb_stop_video(driver: *const KbDriver, index: c_int) -> c_int {
    with_driver(driver, |d| d.stop_video(device_index(index)))
}

/// Start the 640x480 11-bit depth stream of device `index`.
///
/// # Safety
/// `driver` must be a valid driver pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kb_start_depth(driver: *const KbDriver, index: c_int) -> c_int {
    with_driver(driver, |d| d.start_depth(device_index(index)))
}

/// # Safety
/// `driver` must be a valid driver pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kb_stop_depth(driver: *const KbDriver, index: c_int) -> c_int {
    with_driver(driver, |d| d.stop_depth(device_index(index)))
}

/// Set the LED state (0 = off, 1 = green, 2 = red, 3 = yellow,
/// 4 = blink green, 6 = blink red/yellow).
///
/// # Safety
/// `driver` must be a valid driver pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kb_set_led(driver: *const KbDriver, index: c_int, state: c_int) -> c_int {
    with_driver(driver, |d| d.set_led_raw(device_index(index), state))
}

/// Command the tilt motor. The angle is clamped to [-31, 31] degrees.
///
/// # Safety
/// `driver` must be a valid driver pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kb_set_tilt_degrees(
    driver: *const KbDriver,
    index: c_int,
    degrees: f64,
) -> c_int {
    with_driver(driver, |d| d.set_tilt_degrees(device_index(index), degrees))
}

/// Refresh the tilt unit state of device `index` and write it to `out`.
///
/// # Safety
/// `driver` must be a valid driver pointer, or null. `out` must point to
/// writable memory for one `KbTiltState`, or be null.
#[no_mangle]
pub unsafe extern "C" fn kb_get_tilt_state(
    driver: *const KbDriver,
    index: c_int,
    out: *mut KbTiltState,
) -> c_int {
    if out.is_null() {
        return KB_ERR_INVALID_ARGUMENT;
    }
    with_driver(driver, |d| {
        let state = d.tilt_state(device_index(index))?;
        out.write(KbTiltState {
            accelerometer: state.accelerometer,
            accelerometer_mks: state.accelerometer_mks(),
            tilt_degrees: state.degrees(),
            status: state.status as c_int,
        });
        Ok(())
    })
}

/// Get the last error message of the calling thread. Returns NULL if no
/// error. The returned pointer is valid until that thread's next failing
/// kinect-bridge call.
#[no_mangle]
pub extern "C" fn kb_last_error() -> *const c_char {
    LAST_ERROR.with(LastError::as_ptr)
}
