use crate::protocol;
use crate::types::{LogLevel, Subdevices};
use std::time::Duration;

/// Runtime settings for a [`crate::DriverHandle`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound on one event-queue service call. Also bounds how long
    /// shutdown waits for the capture thread beyond the poll in progress.
    pub poll_timeout: Duration,
    /// Initial verbosity of the hardware library.
    pub log_level: LogLevel,
    /// Subdevices claimed when opening a device.
    pub subdevices: Subdevices,
    pub thread_name: String,
    /// Drive the LED from the stream state: off when idle, yellow for depth,
    /// red for video, blinking red/yellow for both.
    pub led_follows_streams: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(protocol::DEFAULT_POLL_TIMEOUT_MS),
            log_level: LogLevel::Warning,
            subdevices: Subdevices::MOTOR | Subdevices::CAMERA,
            thread_name: protocol::CAPTURE_THREAD_NAME.to_string(),
            led_follows_streams: true,
        }
    }
}

impl BridgeConfig {
    /// Build a config from `KINECT_BRIDGE_*` environment variables.
    ///
    /// - `KINECT_BRIDGE_POLL_TIMEOUT_MS`: poll timeout in milliseconds
    /// - `KINECT_BRIDGE_LOG_LEVEL`: driver log level, by name or number
    /// - `KINECT_BRIDGE_MOTOR_ONLY`: claim only the motor subdevice
    /// - `KINECT_BRIDGE_LED_FOLLOWS_STREAMS`: drive the LED from stream state
    ///
    /// Unset or unparseable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let poll_ms = read_env_u64(
            "KINECT_BRIDGE_POLL_TIMEOUT_MS",
            protocol::DEFAULT_POLL_TIMEOUT_MS,
        )
        .max(1);
        let log_level = std::env::var("KINECT_BRIDGE_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::parse(&v))
            .unwrap_or(defaults.log_level);
        let subdevices = if read_env_bool("KINECT_BRIDGE_MOTOR_ONLY", false) {
            Subdevices::MOTOR
        } else {
            defaults.subdevices
        };

        let led_follows_streams =
            read_env_bool("KINECT_BRIDGE_LED_FOLLOWS_STREAMS", defaults.led_follows_streams);

        let config = Self {
            poll_timeout: Duration::from_millis(poll_ms),
            log_level,
            subdevices,
            led_follows_streams,
            ..defaults
        };
        log::debug!("Bridge config: {:?}", config);
        config
    }

    /// Simulated device count for hosts built without libfreenect.
    pub fn simulated_devices() -> usize {
        read_env_u64("KINECT_BRIDGE_SIM_DEVICES", 1) as usize
    }
}

pub(crate) fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

pub(crate) fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_bool(v: &str) -> Option<bool> {
    let v = v.trim().to_ascii_lowercase();
    match v.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_millis(10));
        assert_eq!(config.subdevices, Subdevices::MOTOR | Subdevices::CAMERA);
        assert_eq!(config.log_level, LogLevel::Warning);
        assert!(config.led_follows_streams);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_env_fallback() {
        assert_eq!(read_env_u64("KINECT_BRIDGE_TEST_UNSET_VALUE", 7), 7);
        assert!(read_env_bool("KINECT_BRIDGE_TEST_UNSET_VALUE", true));
    }
}
