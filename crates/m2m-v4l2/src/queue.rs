//! Queue collaborator contract and per-queue streaming state.
//!
//! A [`Queue`] is one directional buffer ring of one device: the bitstream
//! ("output") side or the frame ("capture") side.  Buffer allocation and the
//! (de)queue mechanics live behind this trait; the session and controller
//! only drive it.
//!
//! # Buffer handles
//!
//! ```text
//! decoder capture ──dequeue──▸ DequeuedBuffer ──ImportedBuffer::borrow──▸ converter output
//!        ▲                                                                      │
//!        └──────────── QueueBuffer::Recycle(index) ◂── converter done ──────────┘
//! ```
//!
//! [`ImportedBuffer`] is the only handle an importing queue ever receives.
//! It exposes the exported planes but has no way to free or recycle the
//! underlying memory, which stays owned by the exporting queue.

use bytes::Bytes;

use m2m_core::codec_traits::BitstreamPacket;
use m2m_core::error::{EngineError, Result};
use m2m_core::types::{FourCC, Rect};

// ─── Direction / memory ──────────────────────────────────────────────────

/// Device-centric direction: `Output` feeds the device, `Capture` drains it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Output,
    Capture,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Capture => "capture",
        }
    }
}

/// How a queue's buffers are backed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryModel {
    /// Buffers allocated by the driver and mapped into the process.
    Mmap,
    /// Buffers are dmabuf handles exported by another queue.
    DmaBufImport,
}

/// Pool an importing queue is sized against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportSource {
    pub format: QueueFormat,
    pub buffer_count: u32,
}

// ─── Format descriptor ───────────────────────────────────────────────────

/// Per-plane layout reported by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub bytes_per_line: u32,
    pub size_image: u32,
}

/// Native format descriptor as returned by `VIDIOC_G_FMT`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueFormat {
    pub size: Rect,
    pub fourcc: FourCC,
    pub planes: Vec<PlaneLayout>,
}

impl QueueFormat {
    pub fn new(size: Rect, fourcc: FourCC) -> Self {
        Self {
            size,
            fourcc,
            planes: Vec::new(),
        }
    }
}

// ─── Buffers ─────────────────────────────────────────────────────────────

/// One plane of a buffer dequeued from a queue.
#[derive(Clone, Debug, Default)]
pub struct BufferPlane {
    /// Exported dmabuf descriptor, when the queue exports its buffers.
    pub fd: Option<i32>,
    pub offset: u32,
    pub pitch: u32,
    pub bytes_used: u32,
    /// Mapped contents, when the queue maps its buffers.
    pub data: Option<Bytes>,
}

/// A buffer owned by the queue it was dequeued from.
#[derive(Clone, Debug)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub timestamp: i64,
    pub planes: Vec<BufferPlane>,
}

/// Borrowed capability over another queue's buffer.
///
/// Built only from a [`DequeuedBuffer`]; the exporting queue keeps ownership
/// and gets the buffer back through [`QueueBuffer::Recycle`] once the
/// importing side is done with it.
#[derive(Clone, Debug)]
pub struct ImportedBuffer {
    source_index: u32,
    timestamp: i64,
    planes: Vec<BufferPlane>,
}

impl ImportedBuffer {
    pub fn borrow(buffer: &DequeuedBuffer) -> Self {
        Self {
            source_index: buffer.index,
            timestamp: buffer.timestamp,
            planes: buffer
                .planes
                .iter()
                .map(|p| BufferPlane {
                    fd: p.fd,
                    offset: p.offset,
                    pitch: p.pitch,
                    bytes_used: p.bytes_used,
                    data: None,
                })
                .collect(),
        }
    }

    pub fn source_index(&self) -> u32 {
        self.source_index
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn planes(&self) -> &[BufferPlane] {
        &self.planes
    }
}

/// What can be handed to [`Queue::enqueue`].
#[derive(Debug)]
pub enum QueueBuffer<'a> {
    /// Compressed access unit for a decoder's output queue.
    Bitstream(&'a BitstreamPacket),
    /// Foreign buffer for an importing output queue.
    Imported(ImportedBuffer),
    /// Give a previously dequeued capture buffer back to the device.
    Recycle(u32),
}

/// Dequeue blocking policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until a buffer is ready, an error occurs or the stream ends.
    Block,
    /// Return [`Dequeued::Retry`] immediately if nothing is ready.
    Poll,
}

#[derive(Debug)]
pub enum Dequeued {
    Buffer(DequeuedBuffer),
    Retry,
    EndOfStream,
}

// ─── Queue trait ─────────────────────────────────────────────────────────

/// One directional hardware buffer ring.
///
/// Enqueue on a full output queue fails with
/// [`EngineError::OutOfInputBuffers`]; allocation failures in
/// [`init`](Self::init) are [`EngineError::Allocation`].
pub trait Queue {
    fn direction(&self) -> Direction;

    /// `VIDIOC_S_FMT` with the given size and fourcc.
    fn set_format(&mut self, size: Rect, fourcc: FourCC) -> Result<()>;

    /// `VIDIOC_G_FMT`: the device's current format for this queue.
    fn format(&mut self) -> Result<QueueFormat>;

    /// Request `count` buffers backed by `memory`.
    fn init(&mut self, memory: MemoryModel, count: u32, import: Option<&ImportSource>)
    -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Buffers actually granted by the driver (may exceed the request).
    fn buffer_count(&self) -> u32;

    /// Free every buffer.  The queue must not be streaming.
    fn release(&mut self) -> Result<()>;

    fn set_streaming(&mut self, on: bool) -> Result<()>;

    fn enqueue(&mut self, buffer: QueueBuffer<'_>) -> Result<()>;

    fn dequeue(&mut self, wait: Wait) -> Result<Dequeued>;
}

// ─── Streaming state machine ─────────────────────────────────────────────

/// Lifecycle of one queue as seen by the controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum QueueState {
    /// No format committed, no buffers.
    #[default]
    Idle,
    /// Format known and buffers allocated.
    Configured,
    /// `STREAMON` issued.
    Streaming,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    /// Format committed and buffers allocated.
    Configure,
    StreamOn,
    StreamOff,
    /// Buffers freed.
    Release,
}

impl QueueState {
    /// Pure transition function.
    ///
    /// Repeating the event that led to the current state is a no-op, which
    /// is what makes per-frame start attempts idempotent.
    pub fn apply(self, event: QueueEvent) -> Result<Self> {
        use QueueEvent as E;
        use QueueState as S;
        match (self, event) {
            (S::Idle | S::Configured, E::Configure) => Ok(S::Configured),
            (S::Configured | S::Streaming, E::StreamOn) => Ok(S::Streaming),
            (S::Streaming | S::Configured, E::StreamOff) => Ok(S::Configured),
            (S::Idle, E::StreamOff) => Ok(S::Idle),
            (S::Idle | S::Configured, E::Release) => Ok(S::Idle),
            (state, event) => Err(EngineError::InvariantViolation(format!(
                "Invalid queue transition: {event:?} while {state:?}"
            ))),
        }
    }

    pub fn is_streaming(self) -> bool {
        self == Self::Streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_on_requires_configuration() {
        assert!(QueueState::Idle.apply(QueueEvent::StreamOn).is_err());
        let state = QueueState::Idle
            .apply(QueueEvent::Configure)
            .and_then(|s| s.apply(QueueEvent::StreamOn))
            .expect("configure then stream");
        assert_eq!(state, QueueState::Streaming);
    }

    #[test]
    fn repeated_stream_on_is_a_no_op() {
        let once = QueueState::Configured.apply(QueueEvent::StreamOn).expect("on");
        let twice = once.apply(QueueEvent::StreamOn).expect("on again");
        assert_eq!(once, twice);
    }

    #[test]
    fn release_while_streaming_is_rejected() {
        let err = QueueState::Streaming
            .apply(QueueEvent::Release)
            .expect_err("must stream off first");
        assert!(err.to_string().contains("Release"));
    }

    #[test]
    fn imported_buffer_drops_mapped_bytes() {
        let buffer = DequeuedBuffer {
            index: 5,
            timestamp: 40,
            planes: vec![BufferPlane {
                fd: Some(12),
                pitch: 64,
                bytes_used: 128,
                data: Some(Bytes::from_static(b"pixels")),
                ..Default::default()
            }],
        };
        let imported = ImportedBuffer::borrow(&buffer);
        assert_eq!(imported.source_index(), 5);
        assert_eq!(imported.timestamp(), 40);
        assert_eq!(imported.planes()[0].fd, Some(12));
        assert!(imported.planes()[0].data.is_none());
    }
}
