//! In-process simulated hardware.
//!
//! Behaves like a set of attached devices whose frames are injected by the
//! caller. Used by the test suite, the `simulate` demo and the C ABI when the
//! crate is built without libfreenect.

use crate::backend::{Backend, FrameEvent, SessionContext};
use crate::protocol;
use crate::types::{FrameMode, LedState, LogLevel, StreamKind, Subdevices, TiltState, TiltStatus};
use crate::{BridgeError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Handle to an open simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimHandle(usize);

/// Cloneable handle to a simulated device set. Clones share state, so a test
/// can keep one to inject frames after moving another into the driver.
#[derive(Clone)]
pub struct SimulatedBackend {
    inner: Arc<SimInner>,
}

struct SimInner {
    state: Mutex<SimState>,
    frame_tx: Sender<InjectedFrame>,
    frame_rx: Receiver<InjectedFrame>,
    polls: AtomicU64,
    delivered: AtomicU64,
}

struct InjectedFrame {
    index: usize,
    stream: StreamKind,
    data: Vec<u8>,
}

struct SimState {
    devices: Vec<SimDevice>,
    subdevices: Subdevices,
    log_level: LogLevel,
    fail_init: bool,
    open_errors: HashMap<usize, i32>,
    start_error: Option<i32>,
    timestamp: u32,
}

struct SimDevice {
    open: bool,
    user: Option<SessionContext>,
    modes: [Option<FrameMode>; 2],
    bound: [Option<usize>; 2],
    streaming: [bool; 2],
    led: LedState,
    tilt_angle: i8,
}

impl SimDevice {
    fn new() -> Self {
        Self {
            open: false,
            user: None,
            modes: [None; 2],
            bound: [None; 2],
            streaming: [false; 2],
            led: LedState::Off,
            tilt_angle: 0,
        }
    }
}

fn slot(stream: StreamKind) -> usize {
    match stream {
        StreamKind::Video => 0,
        StreamKind::Depth => 1,
    }
}

impl SimulatedBackend {
    /// A simulated set of `device_count` attached devices.
    pub fn new(device_count: usize) -> Self {
        let (frame_tx, frame_rx) = crossbeam_channel::unbounded();
        let state = SimState {
            devices: (0..device_count).map(|_| SimDevice::new()).collect(),
            subdevices: Subdevices::empty(),
            log_level: LogLevel::Warning,
            fail_init: false,
            open_errors: HashMap::new(),
            start_error: None,
            timestamp: 0,
        };
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(state),
                frame_tx,
                frame_rx,
                polls: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Make enumeration fail as if the hardware subsystem were unavailable.
    pub fn failing_init(self) -> Self {
        self.state().fail_init = true;
        self
    }

    /// Make opening device `index` fail with `code`.
    pub fn failing_open(self, index: usize, code: i32) -> Self {
        self.state().open_errors.insert(index, code);
        self
    }

    /// Make every stream start fail with `code`.
    pub fn failing_start(self, code: i32) -> Self {
        self.state().start_error = Some(code);
        self
    }

    /// Queue a frame for device `index`. It is delivered by the next event
    /// poll if the device is open and the stream started at that time.
    pub fn inject_frame(&self, index: usize, stream: StreamKind, data: Vec<u8>) {
        let _ = self.inner.frame_tx.send(InjectedFrame {
            index,
            stream,
            data,
        });
    }

    /// Queue a full-size patterned frame for the stream's configured mode.
    pub fn inject_synthetic_frame(&self, index: usize, stream: StreamKind) {
        let bytes = self
            .mode(index, stream)
            .unwrap_or_else(|| FrameMode::for_stream(stream))
            .bytes;
        let data = (0..bytes).map(|i| (i % 251) as u8).collect();
        self.inject_frame(index, stream, data);
    }

    /// Number of completed event polls.
    pub fn polls(&self) -> u64 {
        self.inner.polls.load(Ordering::Acquire)
    }

    /// Number of frames handed to the frame handler.
    pub fn frames_delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Acquire)
    }

    pub fn is_open(&self, index: usize) -> bool {
        self.state().devices.get(index).is_some_and(|d| d.open)
    }

    /// Number of currently open devices.
    pub fn open_devices(&self) -> usize {
        self.state().devices.iter().filter(|d| d.open).count()
    }

    pub fn is_streaming(&self, index: usize, stream: StreamKind) -> bool {
        self.state()
            .devices
            .get(index)
            .is_some_and(|d| d.streaming[slot(stream)])
    }

    /// Number of capture buffers currently bound across all devices.
    pub fn bound_buffers(&self) -> usize {
        self.state()
            .devices
            .iter()
            .flat_map(|d| d.bound.iter())
            .filter(|b| b.is_some())
            .count()
    }

    pub fn mode(&self, index: usize, stream: StreamKind) -> Option<FrameMode> {
        self.state()
            .devices
            .get(index)
            .and_then(|d| d.modes[slot(stream)])
    }

    pub fn led(&self, index: usize) -> Option<LedState> {
        self.state().devices.get(index).map(|d| d.led)
    }

    pub fn tilt_degrees(&self, index: usize) -> Option<f64> {
        self.state()
            .devices
            .get(index)
            .map(|d| protocol::raw_to_degrees(d.tilt_angle))
    }

    pub fn log_level(&self) -> LogLevel {
        self.state().log_level
    }

    pub fn subdevices(&self) -> Subdevices {
        self.state().subdevices
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_open<T>(&self, device: SimHandle, f: impl FnOnce(&mut SimDevice) -> T) -> Result<T> {
        let mut state = self.state();
        match state.devices.get_mut(device.0) {
            Some(dev) if dev.open => Ok(f(dev)),
            _ => Err(BridgeError::Hardware {
                call: "simulated device",
                code: -1,
            }),
        }
    }

    /// Resolve where an injected frame goes, if anywhere.
    fn route(&self, frame: &InjectedFrame) -> Option<(SessionContext, u32)> {
        let mut state = self.state();
        let dev = state.devices.get(frame.index)?;
        if !dev.open || !dev.streaming[slot(frame.stream)] {
            return None;
        }
        let context = dev.user?;
        state.timestamp = state.timestamp.wrapping_add(1);
        Some((context, state.timestamp))
    }
}

impl Backend for SimulatedBackend {
    type Device = SimHandle;

    fn select_subdevices(&self, subdevices: Subdevices) {
        self.state().subdevices = subdevices;
    }

    fn num_devices(&self) -> Result<usize> {
        let state = self.state();
        if state.fail_init {
            return Err(BridgeError::Init("simulated subsystem unavailable".into()));
        }
        Ok(state.devices.len())
    }

    fn set_log_level(&self, level: LogLevel) {
        self.state().log_level = level;
    }

    fn open(&self, index: usize) -> Result<SimHandle> {
        let mut state = self.state();
        if let Some(&code) = state.open_errors.get(&index) {
            return Err(BridgeError::Open { index, code });
        }
        match state.devices.get_mut(index) {
            Some(dev) if !dev.open => {
                dev.open = true;
                Ok(SimHandle(index))
            }
            _ => Err(BridgeError::Open { index, code: -1 }),
        }
    }

    fn close(&self, device: SimHandle) -> Result<()> {
        self.with_open(device, |dev| {
            *dev = SimDevice {
                led: dev.led,
                tilt_angle: dev.tilt_angle,
                ..SimDevice::new()
            };
        })
    }

    fn set_user(&self, device: SimHandle, context: SessionContext) {
        let _ = self.with_open(device, |dev| dev.user = Some(context));
    }

    fn set_mode(&self, device: SimHandle, mode: FrameMode) -> Result<()> {
        self.with_open(device, |dev| dev.modes[slot(mode.format.stream())] = Some(mode))
    }

    fn bind_buffer(&self, device: SimHandle, stream: StreamKind, buffer: &mut [u8]) -> Result<()> {
        let len = buffer.len();
        self.with_open(device, |dev| dev.bound[slot(stream)] = Some(len))
    }

    fn start(&self, device: SimHandle, stream: StreamKind) -> Result<()> {
        if let Some(code) = self.state().start_error {
            return Err(BridgeError::Hardware {
                call: "start stream",
                code,
            });
        }
        self.with_open(device, |dev| dev.streaming[slot(stream)] = true)
    }

    fn stop(&self, device: SimHandle, stream: StreamKind) -> Result<()> {
        self.with_open(device, |dev| {
            dev.streaming[slot(stream)] = false;
            dev.bound[slot(stream)] = None;
        })
    }

    fn set_led(&self, device: SimHandle, led: LedState) -> Result<()> {
        self.with_open(device, |dev| dev.led = led)
    }

    fn set_tilt_degrees(&self, device: SimHandle, degrees: f64) -> Result<()> {
        self.with_open(device, |dev| dev.tilt_angle = protocol::tilt_to_raw(degrees))
    }

    fn tilt_state(&self, device: SimHandle) -> Result<TiltState> {
        self.with_open(device, |dev| {
            let radians = protocol::raw_to_degrees(dev.tilt_angle).to_radians();
            TiltState {
                accelerometer: [
                    0,
                    (protocol::COUNTS_PER_G * radians.cos()).round() as i16,
                    (protocol::COUNTS_PER_G * radians.sin()).round() as i16,
                ],
                tilt_angle: dev.tilt_angle,
                status: TiltStatus::Stopped,
            }
        })
    }

    fn process_events(
        &self,
        timeout: Duration,
        on_frame: &mut dyn FnMut(FrameEvent<'_>),
    ) -> Result<()> {
        let first = self.inner.frame_rx.recv_timeout(timeout);
        if let Ok(first) = first {
            let pending: Vec<InjectedFrame> = std::iter::once(first)
                .chain(self.inner.frame_rx.try_iter())
                .collect();

            for frame in pending {
                match self.route(&frame) {
                    Some((context, timestamp)) => {
                        on_frame(FrameEvent {
                            context,
                            stream: frame.stream,
                            timestamp,
                            data: &frame.data,
                        });
                        self.inner.delivered.fetch_add(1, Ordering::AcqRel);
                    }
                    None => log::trace!(
                        "Simulated {} frame for device {} not streaming, dropped",
                        frame.stream,
                        frame.index
                    ),
                }
            }
        }
        self.inner.polls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
