//! Frame, pixel-format and geometry types shared by every crate.
//!
//! # Ownership model
//!
//! A delivered [`Frame`] never owns device memory.  It carries a
//! [`BufferLease`] naming the capture buffer it was produced from; dropping
//! the frame hands the buffer back to the controller, which re-enqueues it
//! on the originating queue during its next call.  Plane bytes are exposed
//! through [`bytes::Bytes`] so cloning a frame's planes is a refcount bump.

use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::Sender;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ─── FourCC ──────────────────────────────────────────────────────────────────

/// Little-endian four-character code as used by V4L2 format descriptors.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FourCC(pub u32);

impl FourCC {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*code))
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.to_bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

// ─── Pixel format ────────────────────────────────────────────────────────────

/// Caller-facing frame layout.
///
/// Each raw variant maps to one or more V4L2 fourccs (single- and
/// multi-planar spellings of the same layout).  Codes with no mapping land
/// on [`PixelFormat::None`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Y plane followed by interleaved CbCr, 2×2 subsampled.
    #[default]
    Nv12,
    /// Y plane followed by interleaved CrCb, 2×2 subsampled.
    Nv21,
    /// NV12 stored in 64×32 macroblock tiles (Samsung MFC native output).
    Nv12Tiled,
    /// Y plane followed by interleaved CbCr, horizontally subsampled only.
    Nv16,
    /// Three planes Y, Cb, Cr, 2×2 subsampled.
    Yuv420p,
    /// Packed Y0 Cb Y1 Cr.
    Yuyv,
    /// Packed Cb Y0 Cr Y1.
    Uyvy,
    /// Packed 8-bit R G B.
    Rgb24,
    /// Packed 8-bit B G R.
    Bgr24,
    /// Packed 8-bit B G R A.
    Bgra32,
    /// Packed 8-bit R G B A.
    Rgba32,
    /// Opaque hardware surface exported as a DRM-PRIME descriptor.
    DrmPrime,
    /// Raw/undefined sentinel for codes this table does not know.
    None,
}

const FOURCC_TABLE: &[(PixelFormat, FourCC)] = &[
    (PixelFormat::Nv12, FourCC::new(b"NV12")),
    (PixelFormat::Nv12, FourCC::new(b"NM12")),
    (PixelFormat::Nv21, FourCC::new(b"NV21")),
    (PixelFormat::Nv21, FourCC::new(b"NM21")),
    (PixelFormat::Nv12Tiled, FourCC::new(b"TM12")),
    (PixelFormat::Nv16, FourCC::new(b"NV16")),
    (PixelFormat::Nv16, FourCC::new(b"NM16")),
    (PixelFormat::Yuv420p, FourCC::new(b"YU12")),
    (PixelFormat::Yuv420p, FourCC::new(b"YM12")),
    (PixelFormat::Yuyv, FourCC::new(b"YUYV")),
    (PixelFormat::Uyvy, FourCC::new(b"UYVY")),
    (PixelFormat::Rgb24, FourCC::new(b"RGB3")),
    (PixelFormat::Bgr24, FourCC::new(b"BGR3")),
    (PixelFormat::Bgra32, FourCC::new(b"AR24")),
    (PixelFormat::Rgba32, FourCC::new(b"AB24")),
];

impl PixelFormat {
    /// Map a device-native fourcc onto the caller-facing format.
    pub fn from_fourcc(code: FourCC) -> Self {
        FOURCC_TABLE
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(fmt, _)| *fmt)
            .unwrap_or(Self::None)
    }

    /// Preferred device fourcc for this layout, `None` for opaque/sentinel values.
    pub fn fourcc(self) -> Option<FourCC> {
        FOURCC_TABLE
            .iter()
            .find(|(fmt, _)| *fmt == self)
            .map(|(_, c)| *c)
    }

    /// Every `(format, fourcc)` pair known to the mapping table.
    pub fn table() -> &'static [(PixelFormat, FourCC)] {
        FOURCC_TABLE
    }

    /// Whether frames of this format are delivered as plane bytes.
    pub fn is_raw(self) -> bool {
        !matches!(self, Self::DrmPrime | Self::None)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nv12 => "nv12",
            Self::Nv21 => "nv21",
            Self::Nv12Tiled => "nv12_tiled",
            Self::Nv16 => "nv16",
            Self::Yuv420p => "yuv420p",
            Self::Yuyv => "yuyv",
            Self::Uyvy => "uyvy",
            Self::Rgb24 => "rgb24",
            Self::Bgr24 => "bgr24",
            Self::Bgra32 => "bgra32",
            Self::Rgba32 => "rgba32",
            Self::DrmPrime => "drm_prime",
            Self::None => "none",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        [
            Self::Nv12,
            Self::Nv21,
            Self::Nv12Tiled,
            Self::Nv16,
            Self::Yuv420p,
            Self::Yuyv,
            Self::Uyvy,
            Self::Rgb24,
            Self::Bgr24,
            Self::Bgra32,
            Self::Rgba32,
            Self::DrmPrime,
        ]
        .into_iter()
        .find(|fmt| fmt.name() == lower)
        .ok_or_else(|| EngineError::Config(format!("Unknown pixel format '{s}'")))
    }
}

// ─── Codec ───────────────────────────────────────────────────────────────────

/// Compressed formats accepted on the decoder's bitstream queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Hevc,
    Mpeg1,
    Mpeg2,
    Mpeg4,
    H263,
    Vc1,
    Vp8,
    Vp9,
}

impl VideoCodec {
    pub const ALL: [VideoCodec; 9] = [
        Self::H264,
        Self::Hevc,
        Self::Mpeg1,
        Self::Mpeg2,
        Self::Mpeg4,
        Self::H263,
        Self::Vc1,
        Self::Vp8,
        Self::Vp9,
    ];

    /// V4L2 compressed fourcc written to the bitstream queue format.
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::H264 => FourCC::new(b"H264"),
            Self::Hevc => FourCC::new(b"HEVC"),
            Self::Mpeg1 => FourCC::new(b"MPG1"),
            Self::Mpeg2 => FourCC::new(b"MPG2"),
            Self::Mpeg4 => FourCC::new(b"MPG4"),
            Self::H263 => FourCC::new(b"H263"),
            Self::Vc1 => FourCC::new(b"VC1G"),
            Self::Vp8 => FourCC::new(b"VP80"),
            Self::Vp9 => FourCC::new(b"VP90"),
        }
    }

    /// Bitstream filter a container demuxer must apply before packets reach
    /// the decoder (length-prefixed NAL units → Annex B).
    pub const fn bitstream_filter(self) -> Option<&'static str> {
        match self {
            Self::H264 => Some("h264_mp4toannexb"),
            Self::Hevc => Some("hevc_mp4toannexb"),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Mpeg1 => "mpeg1",
            Self::Mpeg2 => "mpeg2",
            Self::Mpeg4 => "mpeg4",
            Self::H263 => "h263",
            Self::Vc1 => "vc1",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
        }
    }
}

impl FromStr for VideoCodec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "264" | "avc" => Ok(Self::H264),
            "hevc" | "h265" | "265" => Ok(Self::Hevc),
            "mpeg1" | "mpeg1video" => Ok(Self::Mpeg1),
            "mpeg2" | "mpeg2video" => Ok(Self::Mpeg2),
            "mpeg4" => Ok(Self::Mpeg4),
            "h263" => Ok(Self::H263),
            "vc1" => Ok(Self::Vc1),
            "vp8" => Ok(Self::Vp8),
            "vp9" => Ok(Self::Vp9),
            other => Err(EngineError::Config(format!("Unknown codec '{other}'"))),
        }
    }
}

// ─── Geometry ────────────────────────────────────────────────────────────────

/// Width × height in pixels.  Used for both coded and visible sizes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ─── Buffer lease ────────────────────────────────────────────────────────────

/// Which device session a capture buffer belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferOrigin {
    Decoder,
    Converter,
}

/// A capture buffer handed back by a dropped [`Frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReturnedBuffer {
    pub origin: BufferOrigin,
    pub index: u32,
    /// Pool generation the buffer was dequeued from.  Buffers from a pool
    /// that has since been released are stale and must not be re-enqueued.
    pub generation: u32,
}

/// Keeps a capture buffer out of its queue while a frame references it.
#[derive(Debug)]
pub struct BufferLease {
    buffer: ReturnedBuffer,
    return_tx: Sender<ReturnedBuffer>,
}

impl BufferLease {
    pub fn new(buffer: ReturnedBuffer, return_tx: Sender<ReturnedBuffer>) -> Self {
        Self { buffer, return_tx }
    }

    pub fn buffer(&self) -> ReturnedBuffer {
        self.buffer
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        // The controller may already be gone; nothing to return to then.
        let _ = self.return_tx.send(self.buffer);
    }
}

// ─── Frame ───────────────────────────────────────────────────────────────────

/// One mapped plane of a raw frame.
#[derive(Clone, Debug)]
pub struct FramePlane {
    pub data: Bytes,
    /// Row stride in bytes.
    pub pitch: u32,
}

/// One plane inside a DRM-PRIME layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrmPlane {
    pub object_index: usize,
    pub offset: u32,
    pub pitch: u32,
}

/// One exported dmabuf object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrmObject {
    pub fd: i32,
    pub size: u32,
}

/// Zero-copy hardware surface descriptor.
///
/// File descriptors stay owned by the capture queue; they are valid for as
/// long as the frame (and therefore its lease) is alive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrmDescriptor {
    pub objects: Vec<DrmObject>,
    pub layer_format: FourCC,
    pub planes: Vec<DrmPlane>,
}

/// Pixel storage of a delivered frame.
#[derive(Clone, Debug)]
pub enum FramePayload {
    Planes(Vec<FramePlane>),
    DrmPrime(DrmDescriptor),
}

/// A fully negotiated decoded frame.
#[derive(Debug)]
pub struct Frame {
    pub format: PixelFormat,
    /// Visible (post-crop) size.
    pub visible: Rect,
    /// Coded (possibly padded) size of the buffer.
    pub coded: Rect,
    /// Timestamp copied from the access unit that produced this frame.
    pub pts: i64,
    /// Zero-based delivery index within the session.
    pub sequence: u64,
    pub payload: FramePayload,
    pub lease: BufferLease,
}

/// Result of one frame-pull attempt.
#[derive(Debug)]
pub enum ReceiveOutcome {
    Frame(Frame),
    /// No frame yet; call again (optionally with more input available).
    Retry,
    /// The active output queue reported end-of-stream.
    EndOfStream,
}
