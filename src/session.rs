//! Per-device session records held in the device table.

use crate::host::HostRuntime;
use crate::types::{FrameMode, SessionInfo, StreamKind};
use crate::{BridgeError, Result};

/// One device table slot.
pub(crate) enum DeviceSession<D, H: HostRuntime> {
    Closed,
    Open(OpenSession<D, H>),
}

/// State of an opened device. Holding the hardware handle and the host object
/// reference is what makes the slot open.
pub(crate) struct OpenSession<D, H: HostRuntime> {
    pub device: D,
    pub object: H::Object,
    pub video: Stream<H>,
    pub depth: Stream<H>,
}

pub(crate) struct Stream<H: HostRuntime> {
    /// Callback resolved at open time.
    pub method: H::Method,
    pub state: StreamState<H::ByteArray>,
}

pub(crate) enum StreamState<A> {
    Stopped,
    Started(StreamBuffers<A>),
}

/// Buffers owned by a started stream, both exactly `mode.bytes` long.
pub(crate) struct StreamBuffers<A> {
    pub mode: FrameMode,
    /// Capture target bound to the device.
    pub native: Box<[u8]>,
    /// Host-visible copy handed to the callback.
    pub host: A,
}

impl<D, H: HostRuntime> DeviceSession<D, H> {
    pub fn is_open(&self) -> bool {
        matches!(self, DeviceSession::Open(_))
    }

    pub fn open_mut(&mut self) -> Option<&mut OpenSession<D, H>> {
        match self {
            DeviceSession::Open(session) => Some(session),
            DeviceSession::Closed => None,
        }
    }

    /// Reset the slot to closed, handing back whatever was open.
    pub fn take(&mut self) -> Option<OpenSession<D, H>> {
        match std::mem::replace(self, DeviceSession::Closed) {
            DeviceSession::Open(session) => Some(session),
            DeviceSession::Closed => None,
        }
    }

    pub fn info(&self) -> SessionInfo {
        match self {
            DeviceSession::Closed => SessionInfo::default(),
            DeviceSession::Open(session) => SessionInfo {
                open: true,
                video_started: session.video.is_started(),
                depth_started: session.depth.is_started(),
            },
        }
    }
}

impl<D, H: HostRuntime> OpenSession<D, H> {
    pub fn new(device: D, object: H::Object, video: H::Method, depth: H::Method) -> Self {
        Self {
            device,
            object,
            video: Stream::new(video),
            depth: Stream::new(depth),
        }
    }

    pub fn stream_mut(&mut self, kind: StreamKind) -> &mut Stream<H> {
        match kind {
            StreamKind::Video => &mut self.video,
            StreamKind::Depth => &mut self.depth,
        }
    }
}

impl<H: HostRuntime> Stream<H> {
    fn new(method: H::Method) -> Self {
        Self {
            method,
            state: StreamState::Stopped,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state, StreamState::Started(_))
    }

    /// Mark the stream stopped and hand back its buffers.
    pub fn release(&mut self) -> Option<StreamBuffers<H::ByteArray>> {
        match std::mem::replace(&mut self.state, StreamState::Stopped) {
            StreamState::Started(buffers) => Some(buffers),
            StreamState::Stopped => None,
        }
    }
}

impl<A> StreamBuffers<A> {
    /// Allocate both buffers for `mode`. Nothing is left allocated on failure.
    pub fn allocate<H>(host: &H, mode: FrameMode) -> Result<Self>
    where
        H: HostRuntime<ByteArray = A>,
    {
        let stream = mode.format.stream();
        let native = allocate_native(stream, mode.bytes)?;
        let host = host.new_byte_array(mode.bytes).map_err(|e| {
            log::warn!("Host {} buffer allocation failed: {}", stream, e);
            BridgeError::AllocationFailure {
                stream,
                size: mode.bytes,
            }
        })?;
        Ok(Self { mode, native, host })
    }
}

fn allocate_native(stream: StreamKind, size: usize) -> Result<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| BridgeError::AllocationFailure { stream, size })?;
    buf.resize(size, 0);
    Ok(buf.into_boxed_slice())
}
