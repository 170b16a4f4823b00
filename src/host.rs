//! Host side of the bridge: the runtime that owns callback objects and the
//! buffers frames are delivered in.

use crate::types::{StreamKind, TiltState};
use crate::{BridgeError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Capability for calling into the host runtime.
///
/// `Object` is a durable reference to the caller's callback object: the
/// session owns it from open until close and dropping it releases it.
/// `ByteArray` is a host-visible buffer that outlives individual callbacks.
pub trait HostRuntime: Send + Sync + 'static {
    type Object: Send + 'static;
    /// A resolved callback entry point.
    type Method: Copy + Send + 'static;
    type ByteArray: Send + 'static;

    /// Called once on the capture thread before it delivers any frame.
    fn attach_current_thread(&self, name: &str) -> Result<()>;

    /// Called once on the capture thread before it exits.
    fn detach_current_thread(&self);

    /// Look up the entry point that receives `stream` frames. Called once per
    /// open, never per frame.
    fn resolve_callback(&self, object: &Self::Object, stream: StreamKind) -> Option<Self::Method>;

    fn new_byte_array(&self, len: usize) -> Result<Self::ByteArray>;

    /// Copy `data` into the start of `array`.
    fn set_byte_array_region(&self, array: &mut Self::ByteArray, data: &[u8]);

    /// Invoke `method` on `object` with `array`.
    fn call_callback(
        &self,
        object: &Self::Object,
        method: Self::Method,
        array: &Self::ByteArray,
    ) -> Result<()>;
}

/// Receives frames from an open device.
///
/// Both methods run on the capture thread with the driver lock held. They must
/// not call back into the [`crate::DriverHandle`]; such calls fail with
/// [`BridgeError::Reentrant`]. The slice is only valid for the duration of the
/// call.
pub trait FrameListener: Send + Sync {
    fn video_callback(&self, frame: &[u8]);
    fn depth_callback(&self, frame: &[u8]);
}

/// Receives a tilt state read.
pub trait TiltListener {
    fn tilt_state(&self, state: &TiltState);
}

impl<F: Fn(&TiltState)> TiltListener for F {
    fn tilt_state(&self, state: &TiltState) {
        self(state)
    }
}

/// In-process host: callback objects are Rust [`FrameListener`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustHost;

impl HostRuntime for RustHost {
    type Object = Arc<dyn FrameListener>;
    type Method = StreamKind;
    type ByteArray = Vec<u8>;

    fn attach_current_thread(&self, name: &str) -> Result<()> {
        log::debug!("Thread '{}' attached", name);
        Ok(())
    }

    fn detach_current_thread(&self) {
        log::debug!("Capture thread detached");
    }

    fn resolve_callback(&self, _object: &Self::Object, stream: StreamKind) -> Option<StreamKind> {
        Some(stream)
    }

    fn new_byte_array(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|e| BridgeError::Host(format!("host buffer of {} bytes: {}", len, e)))?;
        buf.resize(len, 0);
        Ok(buf)
    }

    fn set_byte_array_region(&self, array: &mut Vec<u8>, data: &[u8]) {
        array[..data.len()].copy_from_slice(data);
    }

    fn call_callback(
        &self,
        object: &Self::Object,
        method: StreamKind,
        array: &Vec<u8>,
    ) -> Result<()> {
        match method {
            StreamKind::Video => object.video_callback(array),
            StreamKind::Depth => object.depth_callback(array),
        }
        Ok(())
    }
}

/// An owned copy of a delivered frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

/// Listener that forwards owned frames into a bounded channel.
///
/// Frames are dropped when the channel is full so a slow consumer never
/// stalls the capture thread.
pub struct ChannelListener {
    sender: Sender<Frame>,
}

impl ChannelListener {
    fn forward(&self, stream: StreamKind, data: &[u8]) {
        let frame = Frame {
            stream,
            data: data.to_vec(),
        };
        if let Err(e) = self.sender.try_send(frame) {
            match e {
                crossbeam_channel::TrySendError::Full(_) => {
                    log::trace!("Frame channel full, dropping {} frame", stream);
                }
                crossbeam_channel::TrySendError::Disconnected(_) => {
                    log::trace!("Frame receiver gone, dropping {} frame", stream);
                }
            }
        }
    }
}

impl FrameListener for ChannelListener {
    fn video_callback(&self, frame: &[u8]) {
        self.forward(StreamKind::Video, frame);
    }

    fn depth_callback(&self, frame: &[u8]) {
        self.forward(StreamKind::Depth, frame);
    }
}

/// Consumer end of [`frame_channel`].
pub struct FrameReceiver {
    receiver: Receiver<Frame>,
}

impl FrameReceiver {
    /// Receive the next frame (blocks until available).
    pub fn recv(&self) -> Result<Frame> {
        self.receiver.recv().map_err(|_| BridgeError::StreamStopped)
    }

    /// Try to receive a frame without blocking.
    pub fn try_recv(&self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }

    /// Receive a frame with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Frame> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => BridgeError::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => BridgeError::StreamStopped,
        })
    }
}

/// Create a listener/receiver pair holding up to `capacity` frames.
pub fn frame_channel(capacity: usize) -> (Arc<ChannelListener>, FrameReceiver) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity);
    (
        Arc::new(ChannelListener { sender }),
        FrameReceiver { receiver },
    )
}
