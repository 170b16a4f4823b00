//! Hardware primitive layer.
//!
//! A [`Backend`] is the raw device API the bridge drives: enumeration,
//! open/close, stream control, motor control and the event pump. The bridge
//! never talks to hardware except through this trait.

use crate::types::{FrameMode, LedState, LogLevel, StreamKind, Subdevices, TiltState};
use crate::Result;
use std::time::Duration;

/// Opaque per-device context attached to an open device.
///
/// The backend hands it back with every frame so the bridge can find the
/// owning session without a lookup by hardware handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionContext(pub(crate) usize);

impl SessionContext {
    pub fn new(slot: usize) -> Self {
        Self(slot)
    }

    /// Device table slot this context belongs to.
    pub fn slot(self) -> usize {
        self.0
    }
}

/// A completed frame, valid only for the duration of the frame handler call.
#[derive(Debug)]
pub struct FrameEvent<'a> {
    pub context: SessionContext,
    pub stream: StreamKind,
    /// Device timestamp of the frame.
    pub timestamp: u32,
    pub data: &'a [u8],
}

/// The hardware primitive API.
///
/// Methods take `&self`: the capture thread calls [`Backend::process_events`]
/// while caller threads open, close, start and stop devices concurrently.
pub trait Backend: Send + Sync + 'static {
    /// Handle to one open device. Cheap to copy so it can be used outside the
    /// bridge lock.
    type Device: Copy + Send + Sync + 'static;

    /// Choose which subdevices later opens will claim.
    fn select_subdevices(&self, subdevices: Subdevices);

    /// Number of attached devices.
    fn num_devices(&self) -> Result<usize>;

    fn set_log_level(&self, level: LogLevel);

    /// Open device `index`. Hardware failures come back as
    /// [`crate::BridgeError::Open`] carrying the library's code unchanged.
    fn open(&self, index: usize) -> Result<Self::Device>;

    fn close(&self, device: Self::Device) -> Result<()>;

    /// Attach the context returned with this device's frames.
    fn set_user(&self, device: Self::Device, context: SessionContext);

    fn set_mode(&self, device: Self::Device, mode: FrameMode) -> Result<()>;

    /// Bind `buffer` as the capture target for `stream`.
    ///
    /// The backend may keep the buffer's address and write into it until the
    /// stream is stopped. The caller keeps the allocation alive and unmoved
    /// for that long. Backends that manage their own capture memory may ignore
    /// the binding.
    fn bind_buffer(&self, device: Self::Device, stream: StreamKind, buffer: &mut [u8]) -> Result<()>;

    fn start(&self, device: Self::Device, stream: StreamKind) -> Result<()>;

    fn stop(&self, device: Self::Device, stream: StreamKind) -> Result<()>;

    fn set_led(&self, device: Self::Device, led: LedState) -> Result<()>;

    /// Command the tilt motor. Angles outside the motor range are clamped.
    fn set_tilt_degrees(&self, device: Self::Device, degrees: f64) -> Result<()>;

    /// Refresh and return the tilt unit state.
    fn tilt_state(&self, device: Self::Device) -> Result<TiltState>;

    /// Service the event queue for at most `timeout`, calling `on_frame`
    /// synchronously for every frame that completes.
    fn process_events(
        &self,
        timeout: Duration,
        on_frame: &mut dyn FnMut(FrameEvent<'_>),
    ) -> Result<()>;
}
