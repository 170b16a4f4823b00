//! Frame callback bridge.
//!
//! Runs on the capture thread for every completed frame. The whole
//! copy-and-invoke sequence happens under the driver lock, so a concurrent
//! stop or close can never release a buffer in the middle of it.

use crate::backend::{Backend, FrameEvent};
use crate::driver::Shared;
use crate::host::HostRuntime;
use crate::session::{OpenSession, StreamState};
use crate::types::StreamKind;
use crate::{BridgeError, Result};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a host callback until dropped.
struct CallbackScope;

impl CallbackScope {
    fn enter() -> Self {
        IN_CALLBACK.with(|flag| flag.set(true));
        CallbackScope
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_CALLBACK.with(|flag| flag.set(false));
    }
}

/// Fails if called from inside a host callback, where taking the driver lock
/// would deadlock the capture thread against itself.
pub(crate) fn check_reentrancy() -> Result<()> {
    if IN_CALLBACK.with(Cell::get) {
        log::error!("Driver call from inside a frame callback rejected");
        return Err(BridgeError::Reentrant);
    }
    Ok(())
}

/// Copy a completed frame into the host buffer and invoke the host callback.
pub(crate) fn deliver<B, H>(shared: &Shared<B, H>, event: FrameEvent<'_>)
where
    B: Backend,
    H: HostRuntime,
{
    let mut sessions = shared.lock_sessions();

    let slot = event.context.slot();
    let Some(session) = sessions.get_mut(slot).and_then(|s| s.open_mut()) else {
        log::trace!("Dropping {} frame for closed device {}", event.stream, slot);
        return;
    };

    let OpenSession {
        object,
        video,
        depth,
        ..
    } = session;
    let stream = match event.stream {
        StreamKind::Video => video,
        StreamKind::Depth => depth,
    };
    let method = stream.method;
    let StreamState::Started(buffers) = &mut stream.state else {
        log::trace!("Dropping {} frame for stopped stream on device {}", event.stream, slot);
        return;
    };

    let size = buffers.mode.bytes;
    if event.data.len() < size {
        log::warn!(
            "Short {} frame on device {}: {} bytes, expected {}",
            event.stream,
            slot,
            event.data.len(),
            size
        );
        return;
    }

    shared
        .host
        .set_byte_array_region(&mut buffers.host, &event.data[..size]);

    log::trace!(
        "Delivering {} frame ts={} to device {} callback",
        event.stream,
        event.timestamp,
        slot
    );

    let _scope = CallbackScope::enter();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        shared.host.call_callback(&*object, method, &buffers.host)
    }));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("{} callback on device {} failed: {}", event.stream, slot, e),
        Err(_) => log::error!("{} callback on device {} panicked", event.stream, slot),
    }
}
