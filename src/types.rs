use crate::protocol;
use crate::BridgeError;
use std::fmt;

/// The two frame streams a device produces.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Color camera.
    Video = 0,
    /// Depth camera.
    Depth = 1,
}

impl StreamKind {
    /// Name of the host callback entry point that receives this stream.
    pub fn callback_name(self) -> &'static str {
        match self {
            StreamKind::Video => protocol::VIDEO_CALLBACK,
            StreamKind::Depth => protocol::DEPTH_CALLBACK,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Video => f.write_str("video"),
            StreamKind::Depth => f.write_str("depth"),
        }
    }
}

/// Sensor resolution class.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// 320x240
    Low = 0,
    /// 640x480
    Medium = 1,
    /// 1280x1024
    High = 2,
}

impl Resolution {
    pub fn dimensions(self) -> (u16, u16) {
        match self {
            Resolution::Low => (protocol::LOW_WIDTH, protocol::LOW_HEIGHT),
            Resolution::Medium => (protocol::MEDIUM_WIDTH, protocol::MEDIUM_HEIGHT),
            Resolution::High => (protocol::HIGH_WIDTH, protocol::HIGH_HEIGHT),
        }
    }
}

/// Pixel format of a frame mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Bayer-demosaiced RGB888.
    VideoRgb,
    /// 11-bit depth in 16-bit little-endian words.
    Depth11Bit,
}

impl FrameFormat {
    pub fn stream(self) -> StreamKind {
        match self {
            FrameFormat::VideoRgb => StreamKind::Video,
            FrameFormat::Depth11Bit => StreamKind::Depth,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::VideoRgb => protocol::RGB_BYTES_PER_PIXEL,
            FrameFormat::Depth11Bit => protocol::DEPTH_11BIT_BYTES_PER_PIXEL,
        }
    }
}

/// Output mode a stream is configured with before capture starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMode {
    pub resolution: Resolution,
    pub format: FrameFormat,
    pub width: u16,
    pub height: u16,
    /// Size of one complete frame in bytes.
    pub bytes: usize,
    pub framerate: i8,
}

impl FrameMode {
    pub fn new(resolution: Resolution, format: FrameFormat) -> Self {
        let (width, height) = resolution.dimensions();
        let framerate = match format {
            FrameFormat::VideoRgb => protocol::VIDEO_FRAMERATE,
            FrameFormat::Depth11Bit => protocol::DEPTH_FRAMERATE,
        };
        Self {
            resolution,
            format,
            width,
            height,
            bytes: protocol::frame_bytes(width, height, format.bytes_per_pixel()),
            framerate,
        }
    }

    /// Medium resolution RGB, 640x480x3 bytes.
    pub fn video_default() -> Self {
        Self::new(Resolution::Medium, FrameFormat::VideoRgb)
    }

    /// Medium resolution 11-bit depth, 640x480x2 bytes.
    pub fn depth_default() -> Self {
        Self::new(Resolution::Medium, FrameFormat::Depth11Bit)
    }

    /// The fixed mode a stream is started with.
    pub fn for_stream(stream: StreamKind) -> Self {
        match stream {
            StreamKind::Video => Self::video_default(),
            StreamKind::Depth => Self::depth_default(),
        }
    }
}

/// Front-panel LED states.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    Off = 0,
    Green = 1,
    Red = 2,
    Yellow = 3,
    BlinkGreen = 4,
    BlinkRedYellow = 6,
}

impl TryFrom<i32> for LedState {
    type Error = BridgeError;

    fn try_from(value: i32) -> Result<Self, BridgeError> {
        match value {
            0 => Ok(LedState::Off),
            1 => Ok(LedState::Green),
            2 => Ok(LedState::Red),
            3 => Ok(LedState::Yellow),
            4 => Ok(LedState::BlinkGreen),
            6 => Ok(LedState::BlinkRedYellow),
            other => Err(BridgeError::InvalidLed(other)),
        }
    }
}

impl LedState {
    /// LED indication for a device's stream state: off when idle, yellow for
    /// depth only, red for video only, blinking red/yellow for both.
    pub fn for_streams(video: bool, depth: bool) -> LedState {
        match (video, depth) {
            (false, false) => LedState::Off,
            (false, true) => LedState::Yellow,
            (true, false) => LedState::Red,
            (true, true) => LedState::BlinkRedYellow,
        }
    }
}

/// Verbosity of the hardware library's own log output.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Fatal = 0,
    Error = 1,
    Warning = 2,
    Notice = 3,
    Info = 4,
    Debug = 5,
    Spew = 6,
    Flood = 7,
}

impl LogLevel {
    /// The `log` level driver messages at this level are forwarded with.
    pub fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Fatal | LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Notice | LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Spew | LogLevel::Flood => log::Level::Trace,
        }
    }

    /// Parse a level from its name (`"warning"`) or number (`"2"`).
    pub fn parse(s: &str) -> Option<LogLevel> {
        let s = s.trim().to_ascii_lowercase();
        if let Ok(n) = s.parse::<i32>() {
            return LogLevel::try_from(n).ok();
        }
        match s.as_str() {
            "fatal" => Some(LogLevel::Fatal),
            "error" => Some(LogLevel::Error),
            "warning" | "warn" => Some(LogLevel::Warning),
            "notice" => Some(LogLevel::Notice),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "spew" => Some(LogLevel::Spew),
            "flood" => Some(LogLevel::Flood),
            _ => None,
        }
    }
}

impl TryFrom<i32> for LogLevel {
    type Error = BridgeError;

    fn try_from(value: i32) -> Result<Self, BridgeError> {
        match value {
            0 => Ok(LogLevel::Fatal),
            1 => Ok(LogLevel::Error),
            2 => Ok(LogLevel::Warning),
            3 => Ok(LogLevel::Notice),
            4 => Ok(LogLevel::Info),
            5 => Ok(LogLevel::Debug),
            6 => Ok(LogLevel::Spew),
            7 => Ok(LogLevel::Flood),
            other => Err(BridgeError::InvalidLogLevel(other)),
        }
    }
}

bitflags::bitflags! {
    /// Hardware subdevices the driver claims when opening a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct Subdevices: u32 {
        const MOTOR  = 1 << 0;
        const CAMERA = 1 << 1;
        const AUDIO  = 1 << 2;
    }
}

/// Tilt motor status code.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiltStatus {
    Stopped = 0,
    /// The motor reached a mechanical limit.
    Limit = 1,
    Moving = 4,
}

impl TiltStatus {
    pub fn from_raw(raw: i32) -> Option<TiltStatus> {
        match raw {
            0 => Some(TiltStatus::Stopped),
            1 => Some(TiltStatus::Limit),
            4 => Some(TiltStatus::Moving),
            _ => None,
        }
    }
}

/// Raw tilt unit state as reported by the motor.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiltState {
    /// Accelerometer counts [x, y, z]; 819 counts per g.
    pub accelerometer: [i16; 3],
    /// Tilt angle in half-degree units.
    pub tilt_angle: i8,
    pub status: TiltStatus,
}

impl TiltState {
    /// Tilt angle in degrees.
    pub fn degrees(&self) -> f64 {
        protocol::raw_to_degrees(self.tilt_angle)
    }

    /// Accelerometer reading in m/s^2.
    pub fn accelerometer_mks(&self) -> [f64; 3] {
        [
            protocol::counts_to_mks(self.accelerometer[0]),
            protocol::counts_to_mks(self.accelerometer[1]),
            protocol::counts_to_mks(self.accelerometer[2]),
        ]
    }
}

/// Externally observable state of one device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionInfo {
    pub open: bool,
    pub video_started: bool,
    pub depth_started: bool,
}
