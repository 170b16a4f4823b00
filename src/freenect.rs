//! libfreenect backend.
//!
//! Links the system libfreenect. Frame callbacks fire from inside
//! `freenect_process_events_timeout` on the capture thread; the trampolines
//! forward them to the frame handler installed for that call.

use crate::backend::{Backend, FrameEvent, SessionContext};
use crate::types::{
    FrameFormat, FrameMode, LedState, LogLevel, StreamKind, Subdevices, TiltState, TiltStatus,
};
use crate::{BridgeError, Result};
use std::cell::Cell;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::time::Duration;

#[allow(non_camel_case_types)]
mod sys {
    use std::ffi::{c_char, c_int, c_void};

    #[repr(C)]
    pub struct freenect_context {
        _private: [u8; 0],
    }

    #[repr(C)]
    pub struct freenect_device {
        _private: [u8; 0],
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct freenect_frame_mode {
        pub reserved: u32,
        pub resolution: c_int,
        /// Video or depth format, depending on the stream.
        pub format: i32,
        pub bytes: i32,
        pub width: i16,
        pub height: i16,
        pub data_bits_per_pixel: i8,
        pub padding_bits_per_pixel: i8,
        pub framerate: i8,
        pub is_valid: i8,
    }

    #[repr(C)]
    pub struct freenect_raw_tilt_state {
        pub accelerometer_x: i16,
        pub accelerometer_y: i16,
        pub accelerometer_z: i16,
        pub tilt_angle: i8,
        pub tilt_status: c_int,
    }

    pub const FREENECT_VIDEO_RGB: c_int = 0;
    pub const FREENECT_DEPTH_11BIT: c_int = 0;

    pub type freenect_log_cb =
        unsafe extern "C" fn(ctx: *mut freenect_context, level: c_int, msg: *const c_char);
    pub type freenect_frame_cb =
        unsafe extern "C" fn(dev: *mut freenect_device, data: *mut c_void, timestamp: u32);

    #[link(name = "freenect")]
    extern "C" {
        pub fn freenect_init(ctx: *mut *mut freenect_context, usb_ctx: *mut c_void) -> c_int;
        pub fn freenect_shutdown(ctx: *mut freenect_context) -> c_int;
        pub fn freenect_set_log_level(ctx: *mut freenect_context, level: c_int);
        pub fn freenect_set_log_callback(ctx: *mut freenect_context, cb: Option<freenect_log_cb>);
        pub fn freenect_process_events_timeout(
            ctx: *mut freenect_context,
            timeout: *mut libc::timeval,
        ) -> c_int;
        pub fn freenect_num_devices(ctx: *mut freenect_context) -> c_int;
        pub fn freenect_select_subdevices(ctx: *mut freenect_context, subdevs: c_int);
        pub fn freenect_open_device(
            ctx: *mut freenect_context,
            dev: *mut *mut freenect_device,
            index: c_int,
        ) -> c_int;
        pub fn freenect_close_device(dev: *mut freenect_device) -> c_int;
        pub fn freenect_set_user(dev: *mut freenect_device, user: *mut c_void);
        pub fn freenect_get_user(dev: *mut freenect_device) -> *mut c_void;
        pub fn freenect_set_video_callback(dev: *mut freenect_device, cb: Option<freenect_frame_cb>);
        pub fn freenect_set_depth_callback(dev: *mut freenect_device, cb: Option<freenect_frame_cb>);
        pub fn freenect_set_video_buffer(dev: *mut freenect_device, buf: *mut c_void) -> c_int;
        pub fn freenect_set_depth_buffer(dev: *mut freenect_device, buf: *mut c_void) -> c_int;
        pub fn freenect_start_video(dev: *mut freenect_device) -> c_int;
        pub fn freenect_stop_video(dev: *mut freenect_device) -> c_int;
        pub fn freenect_start_depth(dev: *mut freenect_device) -> c_int;
        pub fn freenect_stop_depth(dev: *mut freenect_device) -> c_int;
        pub fn freenect_update_tilt_state(dev: *mut freenect_device) -> c_int;
        pub fn freenect_get_tilt_state(dev: *mut freenect_device) -> *mut freenect_raw_tilt_state;
        pub fn freenect_set_tilt_degs(dev: *mut freenect_device, angle: f64) -> c_int;
        pub fn freenect_set_led(dev: *mut freenect_device, option: c_int) -> c_int;
        pub fn freenect_find_video_mode(res: c_int, fmt: c_int) -> freenect_frame_mode;
        pub fn freenect_find_depth_mode(res: c_int, fmt: c_int) -> freenect_frame_mode;
        pub fn freenect_set_video_mode(dev: *mut freenect_device, mode: freenect_frame_mode) -> c_int;
        pub fn freenect_set_depth_mode(dev: *mut freenect_device, mode: freenect_frame_mode) -> c_int;
        pub fn freenect_get_current_video_mode(dev: *mut freenect_device) -> freenect_frame_mode;
        pub fn freenect_get_current_depth_mode(dev: *mut freenect_device) -> freenect_frame_mode;
    }
}

type FrameSink<'a> = dyn FnMut(FrameEvent<'_>) + 'a;

thread_local! {
    static FRAME_SINK: Cell<Option<NonNull<FrameSink<'static>>>> = const { Cell::new(None) };
}

/// Installs the frame handler for the duration of one event poll.
struct SinkGuard;

impl SinkGuard {
    fn install(sink: &mut FrameSink<'_>) -> SinkGuard {
        let ptr = NonNull::from(sink);
        // SAFETY: only lifetimes differ; the guard clears the pointer before
        // the borrow ends.
        let ptr: NonNull<FrameSink<'static>> = unsafe { std::mem::transmute(ptr) };
        FRAME_SINK.with(|cell| cell.set(Some(ptr)));
        SinkGuard
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        FRAME_SINK.with(|cell| cell.set(None));
    }
}

unsafe extern "C" fn video_trampoline(dev: *mut sys::freenect_device, data: *mut c_void, timestamp: u32) {
    dispatch(dev, data, timestamp, StreamKind::Video);
}

unsafe extern "C" fn depth_trampoline(dev: *mut sys::freenect_device, data: *mut c_void, timestamp: u32) {
    dispatch(dev, data, timestamp, StreamKind::Depth);
}

unsafe fn dispatch(dev: *mut sys::freenect_device, data: *mut c_void, timestamp: u32, stream: StreamKind) {
    let Some(sink) = FRAME_SINK.with(Cell::get) else {
        return;
    };
    if data.is_null() {
        return;
    }

    let mode = match stream {
        StreamKind::Video => sys::freenect_get_current_video_mode(dev),
        StreamKind::Depth => sys::freenect_get_current_depth_mode(dev),
    };
    let len = usize::try_from(mode.bytes).unwrap_or(0);
    let event = FrameEvent {
        context: SessionContext::new(sys::freenect_get_user(dev) as usize),
        stream,
        timestamp,
        data: std::slice::from_raw_parts(data as *const u8, len),
    };

    // Unwinding into libusb would abort the process.
    if panic::catch_unwind(AssertUnwindSafe(|| (*sink.as_ptr())(event))).is_err() {
        log::error!("Frame handler panicked");
    }
}

unsafe extern "C" fn log_trampoline(_ctx: *mut sys::freenect_context, level: c_int, msg: *const c_char) {
    if msg.is_null() {
        return;
    }
    let level = LogLevel::try_from(level)
        .map(LogLevel::as_log_level)
        .unwrap_or(log::Level::Trace);
    let msg = CStr::from_ptr(msg).to_string_lossy();
    log::log!(target: "freenect", level, "{}", msg.trim_end());
}

fn check(call: &'static str, code: c_int) -> Result<()> {
    if code < 0 {
        return Err(BridgeError::Hardware { call, code });
    }
    Ok(())
}

/// Handle to an open libfreenect device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreenectDevice(NonNull<sys::freenect_device>);

// libfreenect device handles are used from caller threads and the capture
// thread; the library serializes access internally.
unsafe impl Send for FreenectDevice {}
unsafe impl Sync for FreenectDevice {}

impl FreenectDevice {
    fn raw(self) -> *mut sys::freenect_device {
        self.0.as_ptr()
    }
}

/// A libfreenect context.
pub struct Freenect {
    ctx: NonNull<sys::freenect_context>,
}

unsafe impl Send for Freenect {}
unsafe impl Sync for Freenect {}

impl Freenect {
    /// Initialize libfreenect and route its log output into `log`.
    pub fn new() -> Result<Self> {
        let mut ctx = ptr::null_mut();
        let code = unsafe { sys::freenect_init(&mut ctx, ptr::null_mut()) };
        let ctx = match NonNull::new(ctx) {
            Some(ctx) if code >= 0 => ctx,
            _ => {
                return Err(BridgeError::Init(format!(
                    "freenect_init failed with code {}",
                    code
                )))
            }
        };
        unsafe { sys::freenect_set_log_callback(ctx.as_ptr(), Some(log_trampoline)) };
        log::debug!("libfreenect context initialized");
        Ok(Self { ctx })
    }

    fn find_mode(mode: FrameMode) -> Result<sys::freenect_frame_mode> {
        let resolution = mode.resolution as c_int;
        let (call, raw) = match mode.format {
            FrameFormat::VideoRgb => ("freenect_find_video_mode", unsafe {
                sys::freenect_find_video_mode(resolution, sys::FREENECT_VIDEO_RGB)
            }),
            FrameFormat::Depth11Bit => ("freenect_find_depth_mode", unsafe {
                sys::freenect_find_depth_mode(resolution, sys::FREENECT_DEPTH_11BIT)
            }),
        };
        if raw.is_valid == 0 {
            return Err(BridgeError::Hardware { call, code: -1 });
        }
        Ok(raw)
    }
}

impl Drop for Freenect {
    fn drop(&mut self) {
        let code = unsafe { sys::freenect_shutdown(self.ctx.as_ptr()) };
        if code < 0 {
            log::warn!("freenect_shutdown failed with code {}", code);
        }
    }
}

impl Backend for Freenect {
    type Device = FreenectDevice;

    fn select_subdevices(&self, subdevices: Subdevices) {
        unsafe { sys::freenect_select_subdevices(self.ctx.as_ptr(), subdevices.bits() as c_int) };
    }

    fn num_devices(&self) -> Result<usize> {
        let n = unsafe { sys::freenect_num_devices(self.ctx.as_ptr()) };
        usize::try_from(n)
            .map_err(|_| BridgeError::Init(format!("freenect_num_devices failed with code {}", n)))
    }

    fn set_log_level(&self, level: LogLevel) {
        unsafe { sys::freenect_set_log_level(self.ctx.as_ptr(), level as c_int) };
    }

    fn open(&self, index: usize) -> Result<FreenectDevice> {
        let raw_index = c_int::try_from(index).map_err(|_| BridgeError::Open { index, code: -1 })?;
        let mut dev = ptr::null_mut();
        let code = unsafe { sys::freenect_open_device(self.ctx.as_ptr(), &mut dev, raw_index) };
        let dev = match NonNull::new(dev) {
            Some(dev) if code >= 0 => FreenectDevice(dev),
            // A null handle with a success code still failed.
            _ => return Err(BridgeError::Open { index, code: code.min(-1) }),
        };
        unsafe {
            sys::freenect_set_video_callback(dev.raw(), Some(video_trampoline));
            sys::freenect_set_depth_callback(dev.raw(), Some(depth_trampoline));
        }
        Ok(dev)
    }

    fn close(&self, device: FreenectDevice) -> Result<()> {
        check("freenect_close_device", unsafe {
            sys::freenect_close_device(device.raw())
        })
    }

    fn set_user(&self, device: FreenectDevice, context: SessionContext) {
        unsafe { sys::freenect_set_user(device.raw(), context.slot() as *mut c_void) };
    }

    fn set_mode(&self, device: FreenectDevice, mode: FrameMode) -> Result<()> {
        let raw = Self::find_mode(mode)?;
        match mode.format {
            FrameFormat::VideoRgb => check("freenect_set_video_mode", unsafe {
                sys::freenect_set_video_mode(device.raw(), raw)
            }),
            FrameFormat::Depth11Bit => check("freenect_set_depth_mode", unsafe {
                sys::freenect_set_depth_mode(device.raw(), raw)
            }),
        }
    }

    fn bind_buffer(&self, device: FreenectDevice, stream: StreamKind, buffer: &mut [u8]) -> Result<()> {
        let buf = buffer.as_mut_ptr() as *mut c_void;
        match stream {
            StreamKind::Video => check("freenect_set_video_buffer", unsafe {
                sys::freenect_set_video_buffer(device.raw(), buf)
            }),
            StreamKind::Depth => check("freenect_set_depth_buffer", unsafe {
                sys::freenect_set_depth_buffer(device.raw(), buf)
            }),
        }
    }

    fn start(&self, device: FreenectDevice, stream: StreamKind) -> Result<()> {
        match stream {
            StreamKind::Video => check("freenect_start_video", unsafe {
                sys::freenect_start_video(device.raw())
            }),
            StreamKind::Depth => check("freenect_start_depth", unsafe {
                sys::freenect_start_depth(device.raw())
            }),
        }
    }

    fn stop(&self, device: FreenectDevice, stream: StreamKind) -> Result<()> {
        match stream {
            StreamKind::Video => check("freenect_stop_video", unsafe {
                sys::freenect_stop_video(device.raw())
            }),
            StreamKind::Depth => check("freenect_stop_depth", unsafe {
                sys::freenect_stop_depth(device.raw())
            }),
        }
    }

    fn set_led(&self, device: FreenectDevice, led: LedState) -> Result<()> {
        check("freenect_set_led", unsafe {
            sys::freenect_set_led(device.raw(), led as c_int)
        })
    }

    fn set_tilt_degrees(&self, device: FreenectDevice, degrees: f64) -> Result<()> {
        check("freenect_set_tilt_degs", unsafe {
            sys::freenect_set_tilt_degs(device.raw(), degrees)
        })
    }

    fn tilt_state(&self, device: FreenectDevice) -> Result<TiltState> {
        check("freenect_update_tilt_state", unsafe {
            sys::freenect_update_tilt_state(device.raw())
        })?;
        let raw = unsafe { sys::freenect_get_tilt_state(device.raw()).as_ref() }.ok_or(
            BridgeError::Hardware {
                call: "freenect_get_tilt_state",
                code: -1,
            },
        )?;
        let status = TiltStatus::from_raw(raw.tilt_status).unwrap_or_else(|| {
            log::debug!("Unknown tilt status {}", raw.tilt_status);
            TiltStatus::Stopped
        });
        Ok(TiltState {
            accelerometer: [raw.accelerometer_x, raw.accelerometer_y, raw.accelerometer_z],
            tilt_angle: raw.tilt_angle,
            status,
        })
    }

    fn process_events(
        &self,
        timeout: Duration,
        on_frame: &mut dyn FnMut(FrameEvent<'_>),
    ) -> Result<()> {
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let _sink = SinkGuard::install(on_frame);
        check("freenect_process_events_timeout", unsafe {
            sys::freenect_process_events_timeout(self.ctx.as_ptr(), &mut tv)
        })
    }
}
