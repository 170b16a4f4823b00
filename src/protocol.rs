// -- Frame geometry --
pub const MEDIUM_WIDTH: u16 = 640;
pub const MEDIUM_HEIGHT: u16 = 480;
pub const LOW_WIDTH: u16 = 320;
pub const LOW_HEIGHT: u16 = 240;
pub const HIGH_WIDTH: u16 = 1280;
pub const HIGH_HEIGHT: u16 = 1024;

/// RGB888 video: 3 bytes per pixel.
pub const RGB_BYTES_PER_PIXEL: usize = 3;
/// 11-bit depth, unpacked into 16-bit words.
pub const DEPTH_11BIT_BYTES_PER_PIXEL: usize = 2;

pub const VIDEO_FRAMERATE: i8 = 30;
pub const DEPTH_FRAMERATE: i8 = 30;

// -- Motor --
/// The motor accepts tilt commands in half-degree steps within this range.
pub const MAX_TILT_DEGREES: f64 = 31.0;
pub const MIN_TILT_DEGREES: f64 = -31.0;

/// Accelerometer counts per 1 g.
pub const COUNTS_PER_G: f64 = 819.0;
/// Standard gravity in m/s^2.
pub const GRAVITY: f64 = 9.80665;

// -- Capture loop --
/// Bound on a single event-queue service call.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10;
pub const CAPTURE_THREAD_NAME: &str = "kinect-capture";

// -- Host callback entry points --
pub const VIDEO_CALLBACK: &str = "videoCallback";
pub const DEPTH_CALLBACK: &str = "depthCallback";

/// Clamp a requested tilt to the motor range and convert to half-degree units.
pub fn tilt_to_raw(degrees: f64) -> i8 {
    let clamped = degrees.clamp(MIN_TILT_DEGREES, MAX_TILT_DEGREES);
    (clamped * 2.0).round() as i8
}

/// Convert a raw half-degree tilt reading to degrees.
pub fn raw_to_degrees(raw: i8) -> f64 {
    f64::from(raw) / 2.0
}

/// Convert raw accelerometer counts to m/s^2.
pub fn counts_to_mks(counts: i16) -> f64 {
    f64::from(counts) / COUNTS_PER_G * GRAVITY
}

/// Byte size of a frame with the given geometry.
pub fn frame_bytes(width: u16, height: u16, bytes_per_pixel: usize) -> usize {
    usize::from(width) * usize::from(height) * bytes_per_pixel
}
