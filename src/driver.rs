use crate::backend::{Backend, SessionContext};
use crate::bridge;
use crate::capture::CaptureThread;
use crate::config::BridgeConfig;
use crate::host::{HostRuntime, TiltListener};
use crate::protocol;
use crate::session::{DeviceSession, OpenSession, StreamBuffers, StreamState};
use crate::types::{FrameMode, LedState, LogLevel, SessionInfo, StreamKind, TiltState};
use crate::{BridgeError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type SessionTable<B, H> = Vec<DeviceSession<<B as Backend>::Device, H>>;

/// State shared between caller threads and the capture thread.
pub(crate) struct Shared<B: Backend, H: HostRuntime> {
    pub backend: B,
    pub host: H,
    /// The one driver lock. Guards every session transition and every buffer
    /// allocation, release and copy.
    sessions: Mutex<SessionTable<B, H>>,
    led_follows_streams: bool,
    /// Set when the last handle went away inside a frame callback. The
    /// capture thread then closes what is still open on its way out.
    orphaned: AtomicBool,
}

impl<B: Backend, H: HostRuntime> Shared<B, H> {
    /// Take the driver lock. A callback that panicked while holding it leaves
    /// the table consistent, so poisoning is recovered.
    pub(crate) fn lock_sessions(&self) -> MutexGuard<'_, SessionTable<B, H>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            log::warn!("Driver lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Take the driver lock on behalf of a caller, refusing calls made from
    /// inside a frame callback.
    fn lock_checked(&self) -> Result<MutexGuard<'_, SessionTable<B, H>>> {
        bridge::check_reentrancy()?;
        Ok(self.lock_sessions())
    }

    pub(crate) fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }

    /// Close every session still open, warning for each.
    pub(crate) fn close_all(&self) {
        let leftover: Vec<(usize, OpenSession<B::Device, H>)> = self
            .lock_sessions()
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.take().map(|session| (index, session)))
            .collect();
        for (index, session) in leftover {
            log::warn!("Device {} still open at shutdown, closing", index);
            if let Err(e) = self.close_session(index, session) {
                log::warn!("Device {} close at shutdown failed: {}", index, e);
            }
        }
    }

    /// Stop, switch off and close a session already taken out of its slot.
    fn close_session(&self, index: usize, mut session: OpenSession<B::Device, H>) -> Result<()> {
        for stream in [StreamKind::Video, StreamKind::Depth] {
            if session.stream_mut(stream).is_started() {
                if let Err(e) = self.backend.stop(session.device, stream) {
                    log::warn!("Device {} {} stop on close failed: {}", index, stream, e);
                }
            }
        }
        if self.led_follows_streams {
            self.show_led(index, session.device, LedState::Off);
        }
        let result = self.backend.close(session.device);
        // Capture is over: buffers and the host reference can go.
        drop(session);
        log::info!("Closed device {}", index);
        result
    }

    /// Set an indicator LED state; failures are logged only.
    fn show_led(&self, index: usize, device: B::Device, led: LedState) {
        if let Err(e) = self.backend.set_led(device, led) {
            log::warn!("Device {} LED update to {:?} failed: {}", index, led, e);
        }
    }
}

/// A running driver: the device table, its lock and the capture thread.
///
/// Every device operation takes the device index. Caller operations on one
/// index are serialized by a per-slot lock that the capture thread never
/// takes, so a hardware call can not race a close of the same device.
pub struct DriverHandle<B: Backend, H: HostRuntime> {
    shared: Arc<Shared<B, H>>,
    device_count: usize,
    slots: Vec<Mutex<()>>,
    capture: Option<CaptureThread>,
}

impl<B: Backend, H: HostRuntime> DriverHandle<B, H> {
    /// Initialize with the default configuration.
    pub fn init(backend: B, host: H) -> Result<Self> {
        Self::init_with_config(backend, host, &BridgeConfig::default())
    }

    /// Enumerate devices, allocate the device table and start the capture
    /// thread.
    ///
    /// Zero attached devices is not an error: the table is empty and the
    /// capture thread still runs.
    pub fn init_with_config(backend: B, host: H, config: &BridgeConfig) -> Result<Self> {
        backend.set_log_level(config.log_level);
        backend.select_subdevices(config.subdevices);
        let device_count = backend.num_devices()?;

        log::info!(
            "Driver initialized: {} device(s), subdevices {:?}",
            device_count,
            config.subdevices
        );

        let sessions = (0..device_count).map(|_| DeviceSession::Closed).collect();
        let shared = Arc::new(Shared {
            backend,
            host,
            sessions: Mutex::new(sessions),
            led_follows_streams: config.led_follows_streams,
            orphaned: AtomicBool::new(false),
        });

        let capture = CaptureThread::spawn(shared.clone(), &config.thread_name, config.poll_timeout)?;

        Ok(DriverHandle {
            shared,
            device_count,
            slots: (0..device_count).map(|_| Mutex::new(())).collect(),
            capture: Some(capture),
        })
    }

    /// Number of devices enumerated at init.
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// The hardware backend.
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// The host runtime.
    pub fn host(&self) -> &H {
        &self.shared.host
    }

    /// Check if the capture thread is still running.
    pub fn is_capture_running(&self) -> bool {
        self.capture
            .as_ref()
            .map(CaptureThread::is_running)
            .unwrap_or(false)
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.shared.backend.set_log_level(level);
    }

    /// Observable state of device slot `index`.
    pub fn session_info(&self, index: usize) -> Result<SessionInfo> {
        self.check_index(index)?;
        Ok(self.shared.lock_checked()?[index].info())
    }

    /// Open device `index` and bind `object` as its callback receiver.
    ///
    /// Both callback entry points are resolved here, once. If either is
    /// missing the open is rolled back: the object reference is released and
    /// the hardware handle closed.
    pub fn open(&self, index: usize, object: H::Object) -> Result<()> {
        let _slot = self.claim(index)?;
        if self.shared.lock_sessions()[index].is_open() {
            return Err(BridgeError::AlreadyOpen(index));
        }

        let backend = &self.shared.backend;
        let device = backend.open(index)?;

        let (video, depth) = match self.resolve_callbacks(&object) {
            Ok(methods) => methods,
            Err(e) => {
                log::warn!("Device {}: {}", index, e);
                drop(object);
                if let Err(close_err) = backend.close(device) {
                    log::warn!("Device {} close after failed bind: {}", index, close_err);
                }
                return Err(e);
            }
        };

        backend.set_user(device, SessionContext::new(index));
        self.shared.lock_sessions()[index] =
            DeviceSession::Open(OpenSession::new(device, object, video, depth));

        log::info!("Opened device {}", index);
        Ok(())
    }

    /// Close device `index`, stopping any started streams first.
    ///
    /// The slot is reset under the lock before any hardware call, so no frame
    /// can reach the session afterwards. Buffers are freed only after capture
    /// has stopped. Closing a closed slot does nothing.
    pub fn close(&self, index: usize) -> Result<()> {
        let _slot = self.claim(index)?;
        let Some(session) = self.shared.lock_sessions()[index].take() else {
            log::debug!("Device {} already closed", index);
            return Ok(());
        };
        self.shared.close_session(index, session)
    }

    pub fn start_video(&self, index: usize) -> Result<()> {
        self.start_stream(index, StreamKind::Video)
    }

    pub fn stop_video(&self, index: usize) -> Result<()> {
        self.stop_stream(index, StreamKind::Video)
    }

    pub fn start_depth(&self, index: usize) -> Result<()> {
        self.start_stream(index, StreamKind::Depth)
    }

    pub fn stop_depth(&self, index: usize) -> Result<()> {
        self.stop_stream(index, StreamKind::Depth)
    }

    /// Configure and start one stream in its fixed default mode.
    ///
    /// Under the lock: set the mode, allocate the capture and host buffers and
    /// bind the capture buffer. Capture itself starts after the lock is
    /// released. Any failure leaves the stream stopped with nothing allocated.
    /// Starting a started stream does nothing.
    pub fn start_stream(&self, index: usize, stream: StreamKind) -> Result<()> {
        let _slot = self.claim(index)?;
        let backend = &self.shared.backend;
        let mode = FrameMode::for_stream(stream);

        let device = {
            let mut sessions = self.shared.lock_sessions();
            let session = sessions[index]
                .open_mut()
                .ok_or(BridgeError::DeviceNotOpen(index))?;
            let device = session.device;
            let state = &mut session.stream_mut(stream).state;
            if matches!(state, StreamState::Started(_)) {
                log::debug!("Device {} {} already started", index, stream);
                return Ok(());
            }

            backend.set_mode(device, mode)?;
            let mut buffers = StreamBuffers::allocate(&self.shared.host, mode)?;
            backend.bind_buffer(device, stream, &mut buffers.native)?;
            *state = StreamState::Started(buffers);
            device
        };

        if let Err(e) = backend.start(device, stream) {
            log::warn!("Device {} {} start failed: {}", index, stream, e);
            let mut sessions = self.shared.lock_sessions();
            if let Some(session) = sessions[index].open_mut() {
                session.stream_mut(stream).release();
            }
            return Err(e);
        }

        log::info!(
            "Started {} on device {} ({}x{}, {} bytes/frame)",
            stream,
            index,
            mode.width,
            mode.height,
            mode.bytes
        );
        self.sync_led(index, device);
        Ok(())
    }

    /// Stop one stream and release its buffers.
    ///
    /// Capture is stopped outside the lock; the buffers are released under it.
    /// If the hardware refuses to stop, the buffers stay bound and the error
    /// is returned. Stopping a stopped stream does nothing.
    pub fn stop_stream(&self, index: usize, stream: StreamKind) -> Result<()> {
        let _slot = self.claim(index)?;

        let device = {
            let mut sessions = self.shared.lock_sessions();
            let session = sessions[index]
                .open_mut()
                .ok_or(BridgeError::DeviceNotOpen(index))?;
            if !session.stream_mut(stream).is_started() {
                log::debug!("Device {} {} already stopped", index, stream);
                return Ok(());
            }
            session.device
        };

        self.shared.backend.stop(device, stream)?;

        let mut sessions = self.shared.lock_sessions();
        if let Some(session) = sessions[index].open_mut() {
            session.stream_mut(stream).release();
        }
        drop(sessions);
        log::info!("Stopped {} on device {}", stream, index);
        self.sync_led(index, device);
        Ok(())
    }

    pub fn set_led(&self, index: usize, led: LedState) -> Result<()> {
        let _slot = self.claim(index)?;
        let device = self.device(index)?;
        log::debug!("Device {} LED -> {:?}", index, led);
        self.shared.backend.set_led(device, led)
    }

    /// Set the LED from its raw numeric code.
    pub fn set_led_raw(&self, index: usize, state: i32) -> Result<()> {
        self.set_led(index, LedState::try_from(state)?)
    }

    /// Command the tilt motor. The angle is clamped to the motor range.
    pub fn set_tilt_degrees(&self, index: usize, degrees: f64) -> Result<()> {
        if !degrees.is_finite() {
            return Err(BridgeError::InvalidTilt(degrees));
        }
        let _slot = self.claim(index)?;
        let device = self.device(index)?;
        let clamped = degrees.clamp(protocol::MIN_TILT_DEGREES, protocol::MAX_TILT_DEGREES);
        log::debug!("Device {} tilt -> {:.1} deg", index, clamped);
        self.shared.backend.set_tilt_degrees(device, clamped)
    }

    /// Refresh and return the tilt unit state.
    pub fn tilt_state(&self, index: usize) -> Result<TiltState> {
        let _slot = self.claim(index)?;
        let device = self.device(index)?;
        self.shared.backend.tilt_state(device)
    }

    /// Refresh the tilt unit state and deliver it to `listener`.
    pub fn get_tilt_state<L>(&self, index: usize, listener: &L) -> Result<TiltState>
    where
        L: TiltListener + ?Sized,
    {
        let state = self.tilt_state(index)?;
        listener.tilt_state(&state);
        Ok(state)
    }

    /// Stop the capture thread and tear down the hardware subsystem.
    ///
    /// Sessions still open are closed first. Blocks for at most one poll
    /// timeout beyond the poll in progress.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(mut capture) = self.capture.take() else {
            return;
        };

        if bridge::check_reentrancy().is_err() {
            // Joining from the capture thread would never return.
            log::warn!("Driver dropped inside a frame callback; capture thread closes remaining sessions");
            self.shared.orphaned.store(true, Ordering::Release);
            capture.detach();
            return;
        }

        capture.stop();
        self.shared.close_all();
        log::info!("Driver shut down");
    }

    /// Point the LED at the current stream state of slot `index`.
    fn sync_led(&self, index: usize, device: B::Device) {
        if !self.shared.led_follows_streams {
            return;
        }
        let info = self.shared.lock_sessions()[index].info();
        let led = LedState::for_streams(info.video_started, info.depth_started);
        self.shared.show_led(index, device, led);
    }

    fn resolve_callbacks(&self, object: &H::Object) -> Result<(H::Method, H::Method)> {
        let host = &self.shared.host;
        let resolve = |stream: StreamKind| {
            host.resolve_callback(object, stream)
                .ok_or(BridgeError::CallbackBindingFailed(stream.callback_name()))
        };
        Ok((resolve(StreamKind::Video)?, resolve(StreamKind::Depth)?))
    }

    /// Serialize caller operations on slot `index` until the guard drops.
    fn claim(&self, index: usize) -> Result<MutexGuard<'_, ()>> {
        self.check_index(index)?;
        bridge::check_reentrancy()?;
        Ok(self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }

    /// Hardware handle of an open device. Callers hold the slot claim, so the
    /// handle stays valid until they release it.
    fn device(&self, index: usize) -> Result<B::Device> {
        self.shared.lock_sessions()[index]
            .open_mut()
            .map(|session| session.device)
            .ok_or(BridgeError::DeviceNotOpen(index))
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.device_count {
            return Err(BridgeError::InvalidDevice {
                index,
                count: self.device_count,
            });
        }
        Ok(())
    }
}

impl<B: Backend, H: HostRuntime> Drop for DriverHandle<B, H> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FrameListener, RustHost};
    use crate::sim::SimulatedBackend;
    use crate::types::Subdevices;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};
    use std::time::{Duration, Instant};

    const VIDEO_BYTES: usize = 640 * 480 * 3;
    const DEPTH_BYTES: usize = 640 * 480 * 2;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    /// Records delivered frame sizes and checks the simulated byte pattern.
    #[derive(Default)]
    struct Recorder {
        video: Mutex<Vec<usize>>,
        depth: Mutex<Vec<usize>>,
        corrupt: AtomicUsize,
    }

    impl Recorder {
        fn check(&self, frame: &[u8]) {
            let bad = frame
                .iter()
                .enumerate()
                .step_by(4099)
                .any(|(i, &b)| b != (i % 251) as u8);
            if bad {
                self.corrupt.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn video_frames(&self) -> Vec<usize> {
            self.video.lock().unwrap().clone()
        }

        fn depth_frames(&self) -> Vec<usize> {
            self.depth.lock().unwrap().clone()
        }
    }

    impl FrameListener for Recorder {
        fn video_callback(&self, frame: &[u8]) {
            self.check(frame);
            self.video.lock().unwrap().push(frame.len());
        }

        fn depth_callback(&self, frame: &[u8]) {
            self.check(frame);
            self.depth.lock().unwrap().push(frame.len());
        }
    }

    fn object(recorder: &Arc<Recorder>) -> Arc<dyn FrameListener> {
        recorder.clone()
    }

    /// Host buffer that tracks how many are alive.
    struct TrackedArray {
        data: Vec<u8>,
        live: Arc<AtomicUsize>,
    }

    impl Drop for TrackedArray {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct TestHost {
        live: Arc<AtomicUsize>,
        missing: Option<StreamKind>,
        fail_alloc: bool,
    }

    impl TestHost {
        fn live_buffers(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }
    }

    impl HostRuntime for TestHost {
        type Object = Arc<dyn FrameListener>;
        type Method = StreamKind;
        type ByteArray = TrackedArray;

        fn attach_current_thread(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn detach_current_thread(&self) {}

        fn resolve_callback(&self, _object: &Self::Object, stream: StreamKind) -> Option<StreamKind> {
            (self.missing != Some(stream)).then_some(stream)
        }

        fn new_byte_array(&self, len: usize) -> Result<TrackedArray> {
            if self.fail_alloc {
                return Err(BridgeError::Host("out of host memory".into()));
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(TrackedArray {
                data: vec![0; len],
                live: self.live.clone(),
            })
        }

        fn set_byte_array_region(&self, array: &mut TrackedArray, data: &[u8]) {
            array.data[..data.len()].copy_from_slice(data);
        }

        fn call_callback(
            &self,
            object: &Self::Object,
            method: StreamKind,
            array: &TrackedArray,
        ) -> Result<()> {
            RustHost.call_callback(object, method, &array.data)
        }
    }

    #[test]
    fn test_single_device_depth_scenario() {
        init_logger();
        let sim = SimulatedBackend::new(1);
        let driver = DriverHandle::init(sim.clone(), RustHost).unwrap();
        assert_eq!(driver.device_count(), 1);

        let recorder = Arc::new(Recorder::default());
        driver.open(0, object(&recorder)).unwrap();
        driver.start_depth(0).unwrap();

        sim.inject_synthetic_frame(0, StreamKind::Depth);
        assert!(wait_until(Duration::from_secs(2), || !recorder
            .depth_frames()
            .is_empty()));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.depth_frames(), vec![DEPTH_BYTES]);
        assert!(recorder.video_frames().is_empty());

        driver.stop_depth(0).unwrap();
        driver.close(0).unwrap();

        let started = Instant::now();
        driver.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(recorder.corrupt.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_open_close_restores_empty_slot() {
        let sim = SimulatedBackend::new(3);
        let driver = DriverHandle::init(sim.clone(), RustHost).unwrap();
        let recorder = Arc::new(Recorder::default());

        for index in 0..driver.device_count() {
            let before = driver.session_info(index).unwrap();
            driver.open(index, object(&recorder)).unwrap();
            assert!(driver.session_info(index).unwrap().open);
            driver.close(index).unwrap();
            assert_eq!(driver.session_info(index).unwrap(), before);
            // Closing again releases nothing twice
            driver.close(index).unwrap();
        }
        assert_eq!(sim.open_devices(), 0);
        assert_eq!(Arc::strong_count(&recorder), 1);
    }

    #[test]
    fn test_start_stop_cycles_do_not_grow_buffers() {
        let sim = SimulatedBackend::new(1);
        let host = TestHost::default();
        let driver = DriverHandle::init(sim.clone(), host.clone()).unwrap();
        driver.open(0, object(&Arc::new(Recorder::default()))).unwrap();

        for _ in 0..10 {
            driver.start_video(0).unwrap();
            driver.start_depth(0).unwrap();
            // A second start reuses the existing buffers
            driver.start_video(0).unwrap();
            assert_eq!(host.live_buffers(), 2);
            assert_eq!(sim.bound_buffers(), 2);
            driver.stop_video(0).unwrap();
            driver.stop_depth(0).unwrap();
        }
        assert_eq!(host.live_buffers(), 0);
        assert_eq!(sim.bound_buffers(), 0);

        // Stopping a stopped stream is a no-op
        driver.stop_depth(0).unwrap();
        driver.close(0).unwrap();
    }

    #[test]
    fn test_delivered_buffers_have_configured_size() {
        let sim = SimulatedBackend::new(1);
        let driver = DriverHandle::init(sim.clone(), RustHost).unwrap();
        let recorder = Arc::new(Recorder::default());
        driver.open(0, object(&recorder)).unwrap();
        driver.start_video(0).unwrap();
        driver.start_depth(0).unwrap();

        sim.inject_synthetic_frame(0, StreamKind::Video);
        sim.inject_synthetic_frame(0, StreamKind::Depth);
        // Oversized frames are truncated to the mode size, short ones dropped
        sim.inject_frame(0, StreamKind::Depth, (0..DEPTH_BYTES + 64).map(|i| (i % 251) as u8).collect());
        sim.inject_frame(0, StreamKind::Video, vec![0; 16]);

        assert!(wait_until(Duration::from_secs(2), || sim.frames_delivered() == 4));
        assert_eq!(recorder.video_frames(), vec![VIDEO_BYTES]);
        assert_eq!(recorder.depth_frames(), vec![DEPTH_BYTES, DEPTH_BYTES]);
        assert_eq!(recorder.corrupt.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_callbacks_after_shutdown() {
        let sim = SimulatedBackend::new(1);
        let driver = DriverHandle::init(sim.clone(), RustHost).unwrap();
        let recorder = Arc::new(Recorder::default());
        driver.open(0, object(&recorder)).unwrap();
        driver.start_depth(0).unwrap();
        assert!(driver.is_capture_running());
        assert!(wait_until(Duration::from_secs(1), || sim.polls() > 0));

        driver.shutdown();

        let polls = sim.polls();
        sim.inject_synthetic_frame(0, StreamKind::Depth);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sim.polls(), polls);
        assert!(recorder.depth_frames().is_empty());
        // Sessions left open are closed by shutdown
        assert_eq!(sim.open_devices(), 0);
        assert!(!sim.is_streaming(0, StreamKind::Depth));
    }

    #[test]
    fn test_close_racing_frame_delivery() {
        init_logger();
        let sim = SimulatedBackend::new(1);
        let host = TestHost::default();
        let driver = DriverHandle::init(sim.clone(), host.clone()).unwrap();
        let recorder = Arc::new(Recorder::default());

        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let injector = {
            let sim = sim.clone();
            let running = running.clone();
            std::thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    sim.inject_synthetic_frame(0, StreamKind::Depth);
                    sim.inject_synthetic_frame(0, StreamKind::Video);
                    std::thread::sleep(Duration::from_micros(500));
                }
            })
        };

        for _ in 0..50 {
            driver.open(0, object(&recorder)).unwrap();
            driver.start_depth(0).unwrap();
            driver.start_video(0).unwrap();
            std::thread::sleep(Duration::from_millis(2));
            driver.close(0).unwrap();
        }

        running.store(false, Ordering::Release);
        injector.join().unwrap();

        assert_eq!(host.live_buffers(), 0);
        assert_eq!(recorder.corrupt.load(Ordering::SeqCst), 0);
        assert!(recorder.depth_frames().iter().all(|&n| n == DEPTH_BYTES));
        assert!(recorder.video_frames().iter().all(|&n| n == VIDEO_BYTES));
        driver.shutdown();
    }

    #[test]
    fn test_callback_binding_failure_rolls_back() {
        let sim = SimulatedBackend::new(1);
        let host = TestHost {
            missing: Some(StreamKind::Depth),
            ..TestHost::default()
        };
        let driver = DriverHandle::init(sim.clone(), host).unwrap();
        let recorder = Arc::new(Recorder::default());

        let err = driver.open(0, object(&recorder)).unwrap_err();
        assert!(matches!(err, BridgeError::CallbackBindingFailed("depthCallback")));
        assert_eq!(sim.open_devices(), 0);
        assert!(!driver.session_info(0).unwrap().open);
        assert_eq!(Arc::strong_count(&recorder), 1);
    }

    #[test]
    fn test_allocation_failure_leaves_stream_stopped() {
        let sim = SimulatedBackend::new(1);
        let host = TestHost {
            fail_alloc: true,
            ..TestHost::default()
        };
        let driver = DriverHandle::init(sim.clone(), host.clone()).unwrap();
        driver.open(0, object(&Arc::new(Recorder::default()))).unwrap();

        let err = driver.start_video(0).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::AllocationFailure {
                stream: StreamKind::Video,
                size: VIDEO_BYTES
            }
        ));
        assert!(!driver.session_info(0).unwrap().video_started);
        assert_eq!(host.live_buffers(), 0);
        assert_eq!(sim.bound_buffers(), 0);
        assert!(!sim.is_streaming(0, StreamKind::Video));
    }

    #[test]
    fn test_start_failure_rolls_back() {
        let sim = SimulatedBackend::new(1).failing_start(-9);
        let host = TestHost::default();
        let driver = DriverHandle::init(sim.clone(), host.clone()).unwrap();
        driver.open(0, object(&Arc::new(Recorder::default()))).unwrap();

        let err = driver.start_depth(0).unwrap_err();
        assert_eq!(err.code(), -9);
        assert!(!driver.session_info(0).unwrap().depth_started);
        assert_eq!(host.live_buffers(), 0);
    }

    #[test]
    fn test_open_errors() {
        let sim = SimulatedBackend::new(2).failing_open(1, -5);
        let driver = DriverHandle::init(sim, RustHost).unwrap();
        let recorder = Arc::new(Recorder::default());

        let err = driver.open(1, object(&recorder)).unwrap_err();
        assert!(matches!(err, BridgeError::Open { index: 1, code: -5 }));
        assert_eq!(err.code(), -5);

        assert!(matches!(
            driver.open(2, object(&recorder)),
            Err(BridgeError::InvalidDevice { index: 2, count: 2 })
        ));
        assert!(matches!(
            driver.start_video(0),
            Err(BridgeError::DeviceNotOpen(0))
        ));

        driver.open(0, object(&recorder)).unwrap();
        assert!(matches!(
            driver.open(0, object(&recorder)),
            Err(BridgeError::AlreadyOpen(0))
        ));
        driver.close(0).unwrap();
    }

    #[test]
    fn test_init_failure_and_zero_devices() {
        let err = DriverHandle::init(SimulatedBackend::new(1).failing_init(), RustHost)
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Init(_)));

        let sim = SimulatedBackend::new(0);
        let driver = DriverHandle::init(sim.clone(), RustHost).unwrap();
        assert_eq!(driver.device_count(), 0);
        assert!(driver.is_capture_running());
        assert!(wait_until(Duration::from_secs(1), || sim.polls() > 0));
        assert!(matches!(
            driver.close(0),
            Err(BridgeError::InvalidDevice { index: 0, count: 0 })
        ));
        driver.shutdown();
    }

    #[test]
    fn test_config_reaches_backend() {
        let sim = SimulatedBackend::new(1);
        let config = BridgeConfig {
            log_level: LogLevel::Debug,
            subdevices: Subdevices::MOTOR,
            poll_timeout: Duration::from_millis(2),
            ..BridgeConfig::default()
        };
        let driver = DriverHandle::init_with_config(sim.clone(), RustHost, &config).unwrap();
        assert_eq!(sim.log_level(), LogLevel::Debug);
        assert_eq!(sim.subdevices(), Subdevices::MOTOR);

        driver.set_log_level(LogLevel::Spew);
        assert_eq!(sim.log_level(), LogLevel::Spew);
    }

    #[test]
    fn test_led_and_tilt() {
        let sim = SimulatedBackend::new(1);
        let driver = DriverHandle::init(sim.clone(), RustHost).unwrap();
        assert!(matches!(
            driver.set_led(0, LedState::Green),
            Err(BridgeError::DeviceNotOpen(0))
        ));
        driver.open(0, object(&Arc::new(Recorder::default()))).unwrap();

        driver.set_led_raw(0, 2).unwrap();
        assert_eq!(sim.led(0), Some(LedState::Red));
        assert!(matches!(driver.set_led_raw(0, 5), Err(BridgeError::InvalidLed(5))));

        driver.set_tilt_degrees(0, 45.0).unwrap();
        assert_eq!(sim.tilt_degrees(0), Some(31.0));
        assert!(matches!(
            driver.set_tilt_degrees(0, f64::NAN),
            Err(BridgeError::InvalidTilt(_))
        ));

        driver.set_tilt_degrees(0, -10.0).unwrap();
        let seen = Mutex::new(None);
        let state = driver
            .get_tilt_state(0, &|s: &TiltState| *seen.lock().unwrap() = Some(*s))
            .unwrap();
        assert!((state.degrees() + 10.0).abs() < 1e-10);
        assert_eq!(*seen.lock().unwrap(), Some(state));
    }

    /// Calls back into the driver from inside its own callback.
    #[derive(Default)]
    struct Reentrant {
        driver: OnceLock<Weak<DriverHandle<SimulatedBackend, RustHost>>>,
        result: Mutex<Option<bool>>,
    }

    impl FrameListener for Reentrant {
        fn video_callback(&self, _frame: &[u8]) {}

        fn depth_callback(&self, _frame: &[u8]) {
            if let Some(driver) = self.driver.get().and_then(Weak::upgrade) {
                let rejected = matches!(driver.stop_depth(0), Err(BridgeError::Reentrant));
                *self.result.lock().unwrap() = Some(rejected);
            }
        }
    }

    #[test]
    fn test_reentrant_call_is_rejected() {
        let sim = SimulatedBackend::new(1);
        let driver = Arc::new(DriverHandle::init(sim.clone(), RustHost).unwrap());
        let listener = Arc::new(Reentrant::default());
        let _ = listener.driver.set(Arc::downgrade(&driver));

        let object: Arc<dyn FrameListener> = listener.clone();
        driver.open(0, object).unwrap();
        driver.start_depth(0).unwrap();
        sim.inject_synthetic_frame(0, StreamKind::Depth);

        assert!(wait_until(Duration::from_secs(2), || listener
            .result
            .lock()
            .unwrap()
            .is_some()));
        assert_eq!(*listener.result.lock().unwrap(), Some(true));
        // The capture thread survived and the stream is still running
        assert!(driver.is_capture_running());
        assert!(driver.session_info(0).unwrap().depth_started);
        driver.close(0).unwrap();
    }

    /// Holds the last driver handle and lets go of it from a callback.
    #[derive(Default)]
    struct LastHandle {
        driver: Mutex<Option<Arc<DriverHandle<SimulatedBackend, RustHost>>>>,
    }

    impl FrameListener for LastHandle {
        fn video_callback(&self, _frame: &[u8]) {}

        fn depth_callback(&self, _frame: &[u8]) {
            let driver = self.driver.lock().unwrap().take();
            drop(driver);
        }
    }

    #[test]
    fn test_drop_inside_callback_closes_sessions() {
        init_logger();
        let sim = SimulatedBackend::new(1);
        let driver = Arc::new(DriverHandle::init(sim.clone(), RustHost).unwrap());
        let listener = Arc::new(LastHandle::default());
        *listener.driver.lock().unwrap() = Some(driver.clone());

        let object: Arc<dyn FrameListener> = listener.clone();
        driver.open(0, object).unwrap();
        driver.start_depth(0).unwrap();
        drop(driver);

        sim.inject_synthetic_frame(0, StreamKind::Depth);
        assert!(wait_until(Duration::from_secs(2), || sim.open_devices() == 0));
        assert!(!sim.is_streaming(0, StreamKind::Depth));
        assert_eq!(sim.bound_buffers(), 0);
        assert_eq!(sim.led(0), Some(LedState::Off));
        // The session released its callback object
        assert!(wait_until(Duration::from_secs(2), || Arc::strong_count(&listener) == 1));

        let polls = sim.polls();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sim.polls(), polls);
    }

    /// Simulated hardware whose stream start blocks until released.
    struct GatedStart {
        sim: SimulatedBackend,
        entered: crossbeam_channel::Sender<()>,
        release: crossbeam_channel::Receiver<()>,
    }

    impl Backend for GatedStart {
        type Device = crate::sim::SimHandle;

        fn select_subdevices(&self, subdevices: Subdevices) {
            self.sim.select_subdevices(subdevices);
        }

        fn num_devices(&self) -> Result<usize> {
            self.sim.num_devices()
        }

        fn set_log_level(&self, level: LogLevel) {
            self.sim.set_log_level(level);
        }

        fn open(&self, index: usize) -> Result<Self::Device> {
            self.sim.open(index)
        }

        fn close(&self, device: Self::Device) -> Result<()> {
            self.sim.close(device)
        }

        fn set_user(&self, device: Self::Device, context: SessionContext) {
            self.sim.set_user(device, context);
        }

        fn set_mode(&self, device: Self::Device, mode: FrameMode) -> Result<()> {
            self.sim.set_mode(device, mode)
        }

        fn bind_buffer(&self, device: Self::Device, stream: StreamKind, buffer: &mut [u8]) -> Result<()> {
            self.sim.bind_buffer(device, stream, buffer)
        }

        fn start(&self, device: Self::Device, stream: StreamKind) -> Result<()> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            self.sim.start(device, stream)
        }

        fn stop(&self, device: Self::Device, stream: StreamKind) -> Result<()> {
            self.sim.stop(device, stream)
        }

        fn set_led(&self, device: Self::Device, led: LedState) -> Result<()> {
            self.sim.set_led(device, led)
        }

        fn set_tilt_degrees(&self, device: Self::Device, degrees: f64) -> Result<()> {
            self.sim.set_tilt_degrees(device, degrees)
        }

        fn tilt_state(&self, device: Self::Device) -> Result<TiltState> {
            self.sim.tilt_state(device)
        }

        fn process_events(
            &self,
            timeout: Duration,
            on_frame: &mut dyn FnMut(crate::backend::FrameEvent<'_>),
        ) -> Result<()> {
            self.sim.process_events(timeout, on_frame)
        }
    }

    #[test]
    fn test_close_waits_for_start_on_same_device() {
        let sim = SimulatedBackend::new(1);
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded(1);
        let backend = GatedStart {
            sim: sim.clone(),
            entered: entered_tx,
            release: release_rx,
        };
        let driver = DriverHandle::init(backend, RustHost).unwrap();
        let recorder = Arc::new(Recorder::default());
        driver.open(0, object(&recorder)).unwrap();

        let driver = &driver;
        std::thread::scope(|s| {
            let starter = s.spawn(move || driver.start_video(0));
            entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            let closer = s.spawn(move || {
                let result = driver.close(0);
                let _ = done_tx.send(());
                result
            });
            // Close can not slip in while the start is still in the hardware
            assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

            release_tx.send(()).unwrap();
            starter.join().unwrap().unwrap();
            closer.join().unwrap().unwrap();
        });

        assert!(!driver.session_info(0).unwrap().open);
        assert!(!sim.is_streaming(0, StreamKind::Video));
        assert_eq!(sim.bound_buffers(), 0);
        assert_eq!(sim.open_devices(), 0);
    }

    #[test]
    fn test_led_follows_stream_state() {
        let sim = SimulatedBackend::new(1);
        let driver = DriverHandle::init(sim.clone(), RustHost).unwrap();
        let recorder = Arc::new(Recorder::default());
        driver.open(0, object(&recorder)).unwrap();

        driver.start_depth(0).unwrap();
        assert_eq!(sim.led(0), Some(LedState::Yellow));
        driver.start_video(0).unwrap();
        assert_eq!(sim.led(0), Some(LedState::BlinkRedYellow));
        driver.stop_depth(0).unwrap();
        assert_eq!(sim.led(0), Some(LedState::Red));
        driver.stop_video(0).unwrap();
        assert_eq!(sim.led(0), Some(LedState::Off));

        driver.start_video(0).unwrap();
        assert_eq!(sim.led(0), Some(LedState::Red));
        driver.close(0).unwrap();
        assert_eq!(sim.led(0), Some(LedState::Off));
    }

    #[test]
    fn test_led_left_alone_when_disabled() {
        let sim = SimulatedBackend::new(1);
        let config = BridgeConfig {
            led_follows_streams: false,
            ..BridgeConfig::default()
        };
        let driver = DriverHandle::init_with_config(sim.clone(), RustHost, &config).unwrap();
        driver.open(0, object(&Arc::new(Recorder::default()))).unwrap();

        driver.set_led(0, LedState::Green).unwrap();
        driver.start_depth(0).unwrap();
        driver.stop_depth(0).unwrap();
        assert_eq!(sim.led(0), Some(LedState::Green));
        driver.close(0).unwrap();
        assert_eq!(sim.led(0), Some(LedState::Green));
    }
}
