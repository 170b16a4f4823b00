use crate::types::StreamKind;
use std::fmt;

/// Errors produced by the driver bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Hardware subsystem unavailable: {0}")]
    Init(String),

    #[error("Failed to open device {index} (code {code})")]
    Open { index: usize, code: i32 },

    #[error("Callback object does not provide {0}")]
    CallbackBindingFailed(&'static str),

    #[error("Failed to allocate {size}-byte {stream} buffer")]
    AllocationFailure { stream: StreamKind, size: usize },

    #[error("Device index {index} out of range (device count {count})")]
    InvalidDevice { index: usize, count: usize },

    #[error("Device {0} is not open")]
    DeviceNotOpen(usize),

    #[error("Device {0} is already open")]
    AlreadyOpen(usize),

    #[error("{call} failed with code {code}")]
    Hardware { call: &'static str, code: i32 },

    #[error("Invalid LED state {0}")]
    InvalidLed(i32),

    #[error("Invalid log level {0}")]
    InvalidLogLevel(i32),

    #[error("Invalid tilt angle {0}")]
    InvalidTilt(f64),

    #[error("Driver call made from inside a frame callback")]
    Reentrant,

    #[error("Failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Host callback failed: {0}")]
    Host(String),

    #[error("Timeout waiting for frame")]
    Timeout,

    #[error("Frame stream stopped")]
    StreamStopped,
}

// Status codes reported across the C ABI.
pub const KB_OK: i32 = 0;
pub const KB_ERR_INIT: i32 = -1;
pub const KB_ERR_CALLBACK_BINDING: i32 = -2;
pub const KB_ERR_ALLOCATION: i32 = -3;
pub const KB_ERR_INVALID_DEVICE: i32 = -4;
pub const KB_ERR_NOT_OPEN: i32 = -5;
pub const KB_ERR_ALREADY_OPEN: i32 = -6;
pub const KB_ERR_INVALID_ARGUMENT: i32 = -7;
pub const KB_ERR_REENTRANT: i32 = -8;
pub const KB_ERR_INTERNAL: i32 = -9;

impl BridgeError {
    /// Status code for the C ABI. Negative hardware codes pass through
    /// unchanged; a non-negative one on an error path becomes
    /// `KB_ERR_INTERNAL` so it can never read as success.
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::Open { code, .. } | BridgeError::Hardware { code, .. } if *code < 0 => *code,
            BridgeError::Open { .. } | BridgeError::Hardware { .. } => KB_ERR_INTERNAL,
            BridgeError::Init(_) => KB_ERR_INIT,
            BridgeError::CallbackBindingFailed(_) => KB_ERR_CALLBACK_BINDING,
            BridgeError::AllocationFailure { .. } => KB_ERR_ALLOCATION,
            BridgeError::InvalidDevice { .. } => KB_ERR_INVALID_DEVICE,
            BridgeError::DeviceNotOpen(_) => KB_ERR_NOT_OPEN,
            BridgeError::AlreadyOpen(_) => KB_ERR_ALREADY_OPEN,
            BridgeError::InvalidLed(_)
            | BridgeError::InvalidLogLevel(_)
            | BridgeError::InvalidTilt(_) => KB_ERR_INVALID_ARGUMENT,
            BridgeError::Reentrant => KB_ERR_REENTRANT,
            BridgeError::Spawn(_)
            | BridgeError::Host(_)
            | BridgeError::Timeout
            | BridgeError::StreamStopped => KB_ERR_INTERNAL,
        }
    }
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &BridgeError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_codes_pass_through() {
        let err = BridgeError::Open { index: 0, code: -3 };
        assert_eq!(err.code(), -3);
        let err = BridgeError::Hardware {
            call: "freenect_start_depth",
            code: -12,
        };
        assert_eq!(err.code(), -12);
    }

    #[test]
    fn test_non_negative_hardware_codes_are_errors() {
        assert_eq!(BridgeError::Open { index: 0, code: 0 }.code(), KB_ERR_INTERNAL);
        let err = BridgeError::Hardware {
            call: "freenect_set_led",
            code: 3,
        };
        assert_eq!(err.code(), KB_ERR_INTERNAL);
    }

    #[test]
    fn test_local_errors_have_distinct_codes() {
        assert_eq!(
            BridgeError::CallbackBindingFailed("depthCallback").code(),
            KB_ERR_CALLBACK_BINDING
        );
        assert_eq!(
            BridgeError::InvalidDevice { index: 4, count: 1 }.code(),
            KB_ERR_INVALID_DEVICE
        );
        assert_eq!(BridgeError::Reentrant.code(), KB_ERR_REENTRANT);
    }

    #[test]
    fn test_last_error_is_nul_terminated() {
        let last = LastError::new();
        assert!(last.as_ptr().is_null());
        last.set(&BridgeError::DeviceNotOpen(2));
        let msg = unsafe { std::ffi::CStr::from_ptr(last.as_ptr()) };
        assert_eq!(msg.to_str().unwrap(), "Device 2 is not open");
    }
}
