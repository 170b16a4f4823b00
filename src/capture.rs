use crate::backend::{Backend, FrameEvent};
use crate::bridge;
use crate::driver::Shared;
use crate::host::HostRuntime;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Handle to the single background thread that services the hardware event
/// queue for every device.
pub(crate) struct CaptureThread {
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureThread {
    /// Spawn the capture thread.
    ///
    /// Frames completed during each poll are delivered through the bridge on
    /// this same thread.
    pub(crate) fn spawn<B, H>(
        shared: Arc<Shared<B, H>>,
        name: &str,
        poll_timeout: Duration,
    ) -> Result<CaptureThread>
    where
        B: Backend,
        H: HostRuntime,
    {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                capture_loop(&shared, &thread_name, poll_timeout, &stop_clone);
            })?;

        Ok(CaptureThread {
            stop_flag,
            thread: Some(thread),
        })
    }

    /// Check if the thread is still running.
    pub(crate) fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Signal the thread without waiting for it.
    pub(crate) fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    /// Signal the thread and let it finish on its own.
    pub(crate) fn detach(mut self) {
        self.request_stop();
        self.thread.take();
    }

    /// Signal the thread and wait for it to exit. Returns once the poll in
    /// progress (bounded by the poll timeout) has finished.
    pub(crate) fn stop(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The capture loop runs in the dedicated thread.
///
/// The stop flag is checked once per iteration, so at most one extra poll runs
/// after a stop request.
fn capture_loop<B, H>(
    shared: &Shared<B, H>,
    name: &str,
    poll_timeout: Duration,
    stop_flag: &AtomicBool,
) where
    B: Backend,
    H: HostRuntime,
{
    if let Err(e) = shared.host.attach_current_thread(name) {
        log::error!("Capture thread failed to attach to host runtime: {}", e);
        return;
    }

    log::info!("Capture thread started (poll timeout {:?})", poll_timeout);

    let mut on_frame = |event: FrameEvent<'_>| bridge::deliver(shared, event);

    loop {
        if stop_flag.load(Ordering::Acquire) {
            log::info!("Capture thread stopping (stop flag set)");
            break;
        }

        if let Err(e) = shared.backend.process_events(poll_timeout, &mut on_frame) {
            log::warn!("Event processing failed: {}", e);
            // Keep a failing backend from spinning.
            std::thread::sleep(poll_timeout);
        }
    }

    if shared.is_orphaned() {
        shared.close_all();
    }

    shared.host.detach_current_thread();
}
