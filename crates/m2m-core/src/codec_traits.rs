//! Shared codec traits used across crate boundaries.
//!
//! These traits give the demux side, the pipeline controller and the CLI a
//! neutral home so none of them depends on another's internals.

use crate::error::Result;
use crate::types::ReceiveOutcome;

// ─── Bitstream source (demuxer → decoder) ────────────────────────────────

/// Compressed access units in submission order.
///
/// Implementations: file reader, network receiver, container demuxer, etc.
/// Bitstream filtering (e.g. length-prefixed → Annex B) happens before
/// packets leave the source.
pub trait BitstreamSource: Send + 'static {
    /// Read the next access unit, or `None` at end-of-stream.
    fn read_packet(&mut self) -> Result<Option<BitstreamPacket>>;
}

/// A single compressed access unit.
#[derive(Clone, Debug, Default)]
pub struct BitstreamPacket {
    /// Compressed payload.  Host memory; copied into a device buffer on enqueue.
    pub data: Vec<u8>,
    /// Presentation timestamp in microseconds.  Carried through the device
    /// and stamped on the frame decoded from this packet.
    pub pts: i64,
    /// Whether this packet starts a keyframe.
    pub is_keyframe: bool,
}

impl BitstreamPacket {
    pub fn new(data: Vec<u8>, pts: i64) -> Self {
        Self {
            data,
            pts,
            is_keyframe: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// In-memory source replaying a fixed list of packets.
pub struct PacketListSource {
    packets: std::collections::VecDeque<BitstreamPacket>,
}

impl PacketListSource {
    pub fn new(packets: impl IntoIterator<Item = BitstreamPacket>) -> Self {
        Self {
            packets: packets.into_iter().collect(),
        }
    }
}

impl BitstreamSource for PacketListSource {
    fn read_packet(&mut self) -> Result<Option<BitstreamPacket>> {
        Ok(self.packets.pop_front())
    }
}

// ─── Frame decoder ───────────────────────────────────────────────────────

/// Pull-style decoder producing negotiated frames.
pub trait FrameDecoder {
    /// Make as much progress as possible and return at most one frame.
    ///
    /// `Retry` means "no frame yet, call again"; `EndOfStream` is sticky.
    /// Fatal conditions are returned as `Err`.
    fn receive_frame(&mut self) -> Result<ReceiveOutcome>;
}
