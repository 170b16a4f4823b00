//! # kinect-bridge - device sessions and frame callbacks for Kinect-class sensors
//!
//! Manages a set of attached depth cameras (color + depth streams, tilt motor,
//! LED). One background capture thread services the hardware event queue for
//! every device and hands each completed frame, synchronously, to a callback
//! object supplied by the host.
//!
//! - [`DriverHandle`]: device table, driver lock and capture thread
//! - [`Backend`]: the raw hardware API ([`SimulatedBackend`], or `Freenect`
//!   with the `libfreenect` feature)
//! - [`HostRuntime`]: how callbacks are invoked ([`RustHost`], or the C ABI in
//!   [`ffi`])
//!
//! ## Quick Start
//! ```no_run
//! use kinect_bridge::{frame_channel, DriverHandle, RustHost, SimulatedBackend, StreamKind};
//! use std::time::Duration;
//!
//! let sim = SimulatedBackend::new(1);
//! let driver = DriverHandle::init(sim.clone(), RustHost).unwrap();
//!
//! let (listener, frames) = frame_channel(8);
//! driver.open(0, listener).unwrap();
//! driver.start_depth(0).unwrap();
//!
//! sim.inject_synthetic_frame(0, StreamKind::Depth);
//! let frame = frames.recv_timeout(Duration::from_secs(1)).unwrap();
//! println!("depth frame: {} bytes", frame.data.len());
//!
//! driver.close(0).unwrap();
//! driver.shutdown();
//! ```
//!
//! Frame callbacks run on the capture thread with the driver lock held and
//! must not call back into the driver.

pub mod error;
pub mod types;
pub mod protocol;
pub mod config;
pub mod backend;
pub mod host;
mod session;
mod bridge;
mod capture;
pub mod driver;
pub mod sim;
#[cfg(feature = "libfreenect")]
pub mod freenect;
pub mod ffi;

pub use backend::{Backend, FrameEvent, SessionContext};
pub use config::BridgeConfig;
pub use driver::DriverHandle;
pub use error::BridgeError;
pub use host::{frame_channel, Frame, FrameListener, FrameReceiver, HostRuntime, RustHost, TiltListener};
pub use sim::SimulatedBackend;
pub use types::*;

#[cfg(feature = "libfreenect")]
pub use freenect::Freenect;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Initialize libfreenect with settings from the environment and start the
/// driver with an in-process host.
#[cfg(feature = "libfreenect")]
pub fn init() -> Result<DriverHandle<Freenect, RustHost>> {
    let config = BridgeConfig::from_env();
    DriverHandle::init_with_config(Freenect::new()?, RustHost, &config)
}
