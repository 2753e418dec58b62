//! Raw FFI bindings to the V4L2 ioctl interface (`linux/videodev2.h`).
//!
//! Covers the minimal subset required by [`V4l2Device`](super::device::V4l2Device):
//! capability query, format get, selection/crop, event subscription and the
//! decoder stop command.  Layouts match the 64-bit kernel ABI.
//!
//! # Safety
//!
//! Every `vidioc_*` function is an `unsafe` ioctl wrapper generated by `nix`.
//! Callers pass a valid open descriptor and a pointer to a fully initialised
//! struct of the matching type.

#![allow(non_camel_case_types)]

// ═══════════════════════════════════════════════════════════════════════════
//  CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 10;

pub const V4L2_CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
pub const V4L2_CAP_VIDEO_M2M: u32 = 0x0000_8000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

pub const V4L2_SEL_TGT_CROP: u32 = 0x0000;

pub const V4L2_EVENT_EOS: u32 = 2;
pub const V4L2_EVENT_SOURCE_CHANGE: u32 = 5;
pub const V4L2_EVENT_SRC_CH_RESOLUTION: u32 = 1 << 0;

pub const V4L2_DEC_CMD_STOP: u32 = 1;

pub const VIDEO_MAX_PLANES: usize = 8;

// ═══════════════════════════════════════════════════════════════════════════
//  STRUCTS
// ═══════════════════════════════════════════════════════════════════════════

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_crop {
    pub type_: u32,
    pub c: v4l2_rect,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_selection {
    pub type_: u32,
    pub target: u32,
    pub flags: u32,
    pub r: v4l2_rect,
    pub reserved: [u32; 9],
}

/// `struct v4l2_pix_format`, used by single-planar devices.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

/// Leading fields of `struct v4l2_pix_format_mplane`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_plane_pix_format {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_pix_format_mplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [v4l2_plane_pix_format; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

/// `struct v4l2_format`: the 200-byte union is 8-byte aligned on 64-bit
/// because `struct v4l2_window` carries pointers.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: [u64; 25],
}

impl v4l2_format {
    pub fn new(type_: u32) -> Self {
        Self {
            type_,
            fmt: [0; 25],
        }
    }

    pub fn pix(&self) -> v4l2_pix_format {
        // SAFETY: the union is larger than `v4l2_pix_format`; both are POD.
        unsafe { std::ptr::read_unaligned(self.fmt.as_ptr() as *const v4l2_pix_format) }
    }

    pub fn pix_mp(&self) -> v4l2_pix_format_mplane {
        // SAFETY: the union is 200 bytes, larger than the mplane variant,
        // and both types are plain old data.
        unsafe { std::ptr::read_unaligned(self.fmt.as_ptr() as *const v4l2_pix_format_mplane) }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_event_subscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_event {
    pub type_: u32,
    /// 64-byte payload union (`src_change.changes` is the first `u32`).
    pub u: [u64; 8],
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: libc::timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

impl v4l2_event {
    pub fn zeroed() -> Self {
        // SAFETY: all-zero is a valid bit pattern for this POD struct.
        unsafe { std::mem::zeroed() }
    }

    pub fn src_change(&self) -> u32 {
        (self.u[0] & 0xffff_ffff) as u32
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_decoder_cmd {
    pub cmd: u32,
    pub flags: u32,
    pub raw: [u64; 8],
}

// ═══════════════════════════════════════════════════════════════════════════
//  IOCTLS
// ═══════════════════════════════════════════════════════════════════════════

nix::ioctl_read!(vidioc_querycap, b'V', 0, v4l2_capability);
nix::ioctl_readwrite!(vidioc_g_fmt, b'V', 4, v4l2_format);
nix::ioctl_readwrite!(vidioc_g_crop, b'V', 59, v4l2_crop);
nix::ioctl_write_ptr!(vidioc_s_crop, b'V', 60, v4l2_crop);
nix::ioctl_read!(vidioc_dqevent, b'V', 89, v4l2_event);
nix::ioctl_write_ptr!(vidioc_subscribe_event, b'V', 90, v4l2_event_subscription);
nix::ioctl_readwrite!(vidioc_g_selection, b'V', 94, v4l2_selection);
nix::ioctl_readwrite!(vidioc_s_selection, b'V', 95, v4l2_selection);
nix::ioctl_readwrite!(vidioc_decoder_cmd, b'V', 96, v4l2_decoder_cmd);
