//! Device-level control surface (ioctls addressed to the device node rather
//! than to one of its queues) and the real V4L2 implementation.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::{debug, info};

use crate::queue::{Direction, PlaneLayout, QueueFormat};
use crate::sys::*;
use m2m_core::error::{EngineError, Result};
use m2m_core::types::{FourCC, Rect};

/// What a device session is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    Decoder,
    Converter,
}

impl DeviceRole {
    pub fn label(self) -> &'static str {
        match self {
            Self::Decoder => "decoder",
            Self::Converter => "converter",
        }
    }
}

/// Out-of-band notification dequeued from a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Source parameters changed; `changes` carries the kernel's bitmask.
    SourceChange { changes: u32 },
    EndOfStream,
    Other(u32),
}

/// Device-node ioctls used during negotiation and event handling.
pub trait DeviceControl {
    fn role(&self) -> DeviceRole;

    /// Open and probe the device.  Idempotent.
    fn open(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// `VIDIOC_S_SELECTION` on the capture side.
    fn set_selection(&mut self, rect: Rect) -> Result<()>;

    /// `VIDIOC_G_SELECTION` on the capture side.
    fn selection(&mut self) -> Result<Rect>;

    /// `VIDIOC_S_CROP` on the capture side.
    fn set_crop(&mut self, rect: Rect) -> Result<()>;

    /// `VIDIOC_G_CROP` on the capture side.
    fn crop(&mut self) -> Result<Rect>;

    /// Subscribe to `V4L2_EVENT_SOURCE_CHANGE`.
    fn subscribe_source_change(&mut self) -> Result<()>;

    /// Non-blocking `VIDIOC_DQEVENT`.
    fn dequeue_event(&mut self) -> Result<Option<DeviceEvent>>;

    /// `V4L2_DEC_CMD_STOP`: flush pending input and mark the last capture buffer.
    fn stop_decoder(&mut self) -> Result<()>;
}

// ─── Real device ─────────────────────────────────────────────────────────

/// Identification returned by `VIDIOC_QUERYCAP`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capabilities: u32,
    pub multiplanar: bool,
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A V4L2 mem2mem device node.
pub struct V4l2Device {
    path: PathBuf,
    role: DeviceRole,
    file: Option<File>,
    caps: Option<DeviceCaps>,
}

impl V4l2Device {
    /// Create an unopened handle; [`DeviceControl::open`] does the probing.
    pub fn new(path: impl Into<PathBuf>, role: DeviceRole) -> Self {
        Self {
            path: path.into(),
            role,
            file: None,
            caps: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capabilities(&self) -> Option<&DeviceCaps> {
        self.caps.as_ref()
    }

    fn raw_fd(&self, ioctl: &'static str) -> Result<i32> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| EngineError::ioctl(ioctl, Errno::EBADF))
    }

    fn multiplanar(&self) -> bool {
        self.caps.as_ref().is_some_and(|c| c.multiplanar)
    }

    fn buf_type(&self, direction: Direction) -> u32 {
        match (direction, self.multiplanar()) {
            (Direction::Capture, true) => V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            (Direction::Capture, false) => V4L2_BUF_TYPE_VIDEO_CAPTURE,
            (Direction::Output, true) => V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            (Direction::Output, false) => V4L2_BUF_TYPE_VIDEO_OUTPUT,
        }
    }

    /// `VIDIOC_G_FMT` for one side of the device.
    pub fn query_format(&self, direction: Direction) -> Result<QueueFormat> {
        let fd = self.raw_fd("VIDIOC_G_FMT")?;
        let mut fmt = v4l2_format::new(self.buf_type(direction));
        // SAFETY: fd is open and fmt is a fully initialised v4l2_format.
        unsafe { vidioc_g_fmt(fd, &mut fmt) }.map_err(|e| EngineError::ioctl("VIDIOC_G_FMT", e))?;
        Ok(queue_format(&fmt, self.multiplanar()))
    }
}

/// Decode the `G_FMT` union according to the device's buffer API.
fn queue_format(fmt: &v4l2_format, multiplanar: bool) -> QueueFormat {
    if !multiplanar {
        let pix = fmt.pix();
        return QueueFormat {
            size: Rect::new(pix.width, pix.height),
            fourcc: FourCC(pix.pixelformat),
            planes: vec![PlaneLayout {
                bytes_per_line: pix.bytesperline,
                size_image: pix.sizeimage,
            }],
        };
    }
    let pix = fmt.pix_mp();
    let num_planes = (pix.num_planes as usize).min(VIDEO_MAX_PLANES);
    QueueFormat {
        size: Rect::new(pix.width, pix.height),
        fourcc: FourCC(pix.pixelformat),
        planes: pix.plane_fmt[..num_planes]
            .iter()
            .map(|p| PlaneLayout {
                bytes_per_line: p.bytesperline,
                size_image: p.sizeimage,
            })
            .collect(),
    }
}

impl DeviceControl for V4l2Device {
    fn role(&self) -> DeviceRole {
        self.role
    }

    fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&self.path)
            .map_err(|source| EngineError::DeviceOpen {
                path: self.path.clone(),
                source,
            })?;

        // SAFETY: all-zero is a valid v4l2_capability; the kernel fills it.
        let mut cap: v4l2_capability = unsafe { std::mem::zeroed() };
        // SAFETY: fd is open for the lifetime of `file`.
        unsafe { vidioc_querycap(file.as_raw_fd(), &mut cap) }
            .map_err(|e| EngineError::ioctl("VIDIOC_QUERYCAP", e))?;

        let caps_field = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        let multiplanar = caps_field & V4L2_CAP_VIDEO_M2M_MPLANE != 0;
        if !multiplanar && caps_field & V4L2_CAP_VIDEO_M2M == 0 {
            return Err(EngineError::NotM2mDevice(self.path.display().to_string()));
        }

        let caps = DeviceCaps {
            driver: c_string(&cap.driver),
            card: c_string(&cap.card),
            bus_info: c_string(&cap.bus_info),
            capabilities: caps_field,
            multiplanar,
        };
        info!(
            path = %self.path.display(),
            role = self.role.label(),
            driver = %caps.driver,
            card = %caps.card,
            multiplanar,
            "V4L2 device opened"
        );

        self.caps = Some(caps);
        self.file = Some(file);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn set_selection(&mut self, rect: Rect) -> Result<()> {
        let fd = self.raw_fd("VIDIOC_S_SELECTION")?;
        let mut sel = v4l2_selection {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            target: V4L2_SEL_TGT_CROP,
            r: v4l2_rect {
                width: rect.width,
                height: rect.height,
                ..Default::default()
            },
            ..Default::default()
        };
        // SAFETY: fd is open and sel is fully initialised.
        unsafe { vidioc_s_selection(fd, &mut sel) }
            .map_err(|e| EngineError::ioctl("VIDIOC_S_SELECTION", e))?;
        Ok(())
    }

    fn selection(&mut self) -> Result<Rect> {
        let fd = self.raw_fd("VIDIOC_G_SELECTION")?;
        let mut sel = v4l2_selection {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            target: V4L2_SEL_TGT_CROP,
            ..Default::default()
        };
        // SAFETY: fd is open and sel is fully initialised.
        unsafe { vidioc_g_selection(fd, &mut sel) }
            .map_err(|e| EngineError::ioctl("VIDIOC_G_SELECTION", e))?;
        Ok(Rect::new(sel.r.width, sel.r.height))
    }

    fn set_crop(&mut self, rect: Rect) -> Result<()> {
        let fd = self.raw_fd("VIDIOC_S_CROP")?;
        let crop = v4l2_crop {
            type_: self.buf_type(Direction::Capture),
            c: v4l2_rect {
                width: rect.width,
                height: rect.height,
                ..Default::default()
            },
        };
        // SAFETY: fd is open and crop is fully initialised.
        unsafe { vidioc_s_crop(fd, &crop) }.map_err(|e| EngineError::ioctl("VIDIOC_S_CROP", e))?;
        Ok(())
    }

    fn crop(&mut self) -> Result<Rect> {
        let fd = self.raw_fd("VIDIOC_G_CROP")?;
        let mut crop = v4l2_crop {
            type_: self.buf_type(Direction::Capture),
            ..Default::default()
        };
        // SAFETY: fd is open and crop is fully initialised.
        unsafe { vidioc_g_crop(fd, &mut crop) }
            .map_err(|e| EngineError::ioctl("VIDIOC_G_CROP", e))?;
        Ok(Rect::new(crop.c.width, crop.c.height))
    }

    fn subscribe_source_change(&mut self) -> Result<()> {
        let fd = self.raw_fd("VIDIOC_SUBSCRIBE_EVENT")?;
        let sub = v4l2_event_subscription {
            type_: V4L2_EVENT_SOURCE_CHANGE,
            ..Default::default()
        };
        // SAFETY: fd is open and sub is fully initialised.
        unsafe { vidioc_subscribe_event(fd, &sub) }
            .map_err(|e| EngineError::ioctl("VIDIOC_SUBSCRIBE_EVENT", e))?;
        debug!(path = %self.path.display(), "Subscribed to source change events");
        Ok(())
    }

    fn dequeue_event(&mut self) -> Result<Option<DeviceEvent>> {
        let fd = self.raw_fd("VIDIOC_DQEVENT")?;
        let mut ev = v4l2_event::zeroed();
        // SAFETY: fd is open and ev is a zeroed v4l2_event the kernel fills.
        match unsafe { vidioc_dqevent(fd, &mut ev) } {
            Ok(_) => Ok(Some(match ev.type_ {
                V4L2_EVENT_SOURCE_CHANGE => DeviceEvent::SourceChange {
                    changes: ev.src_change(),
                },
                V4L2_EVENT_EOS => DeviceEvent::EndOfStream,
                other => DeviceEvent::Other(other),
            })),
            // No pending event.
            Err(Errno::ENOENT) => Ok(None),
            Err(e) => Err(EngineError::ioctl("VIDIOC_DQEVENT", e)),
        }
    }

    fn stop_decoder(&mut self) -> Result<()> {
        let fd = self.raw_fd("VIDIOC_DECODER_CMD")?;
        let mut cmd = v4l2_decoder_cmd {
            cmd: V4L2_DEC_CMD_STOP,
            flags: 0,
            raw: [0; 8],
        };
        // SAFETY: fd is open and cmd is fully initialised.
        unsafe { vidioc_decoder_cmd(fd, &mut cmd) }
            .map_err(|e| EngineError::ioctl("VIDIOC_DECODER_CMD", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_string_stops_at_nul() {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(b"s5p-mfc\0");
        assert_eq!(c_string(&raw), "s5p-mfc");
    }

    #[test]
    fn ioctls_on_unopened_device_fail_cleanly() {
        let mut dev = V4l2Device::new("/dev/null-m2m", DeviceRole::Decoder);
        let err = dev.selection().expect_err("not opened");
        assert!(err.to_string().contains("VIDIOC_G_SELECTION"));
        assert!(!dev.is_open());
    }

    fn format_with(pix: v4l2_pix_format, mplane_plane_count: u8) -> v4l2_format {
        let mut fmt = v4l2_format::new(V4L2_BUF_TYPE_VIDEO_CAPTURE);
        let base = fmt.fmt.as_mut_ptr() as *mut u8;
        // SAFETY: both writes stay inside the 200-byte union.
        unsafe {
            std::ptr::write_unaligned(base as *mut v4l2_pix_format, pix);
            // `num_planes` of the multi-planar variant lives at byte 180.
            base.add(180).write(mplane_plane_count);
        }
        fmt
    }

    #[test]
    fn single_planar_format_reads_the_pix_variant() {
        let fmt = format_with(
            v4l2_pix_format {
                width: 1280,
                height: 720,
                pixelformat: FourCC::new(b"NV12").0,
                bytesperline: 1280,
                sizeimage: 1280 * 720 * 3 / 2,
                ..Default::default()
            },
            3,
        );

        let format = queue_format(&fmt, false);
        assert_eq!(format.size, Rect::new(1280, 720));
        assert_eq!(format.fourcc, FourCC::new(b"NV12"));
        assert_eq!(
            format.planes,
            vec![PlaneLayout {
                bytes_per_line: 1280,
                size_image: 1280 * 720 * 3 / 2,
            }]
        );
    }

    #[test]
    fn multi_planar_format_honours_plane_count() {
        let fmt = format_with(
            v4l2_pix_format {
                width: 64,
                height: 32,
                pixelformat: FourCC::new(b"NM12").0,
                ..Default::default()
            },
            2,
        );
        let format = queue_format(&fmt, true);
        assert_eq!(format.size, Rect::new(64, 32));
        assert_eq!(format.planes.len(), 2);
    }

    #[test]
    fn opening_a_missing_node_reports_the_path() {
        let mut dev = V4l2Device::new("/nonexistent/video99", DeviceRole::Converter);
        let err = dev.open().expect_err("missing node");
        assert_eq!(err.error_code(), 101);
        assert!(err.to_string().contains("/nonexistent/video99"));
    }
}
