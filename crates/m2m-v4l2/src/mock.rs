//! Scriptable in-process M2M device.
//!
//! [`MockM2m`] models one device with a bitstream-side and a frame-side
//! queue.  All handles produced by one `MockM2m` share its state, so a test
//! can hand the device and queues to a [`DeviceSession`] and still script
//! behaviour and read call counters afterwards.
//!
//! Processing model: every buffer enqueued on the output side becomes one
//! pending input.  A capture dequeue consumes the oldest pending input and
//! produces one frame, provided both queues stream and a capture buffer is
//! free.  After [`DeviceControl::stop_decoder`] the capture side reports
//! end-of-stream once every pending input has been consumed.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;

use bytes::Bytes;
use nix::errno::Errno;

use crate::device::{DeviceControl, DeviceEvent, DeviceRole};
use crate::queue::{
    BufferPlane, Dequeued, DequeuedBuffer, Direction, ImportSource, MemoryModel, PlaneLayout,
    Queue, QueueBuffer, QueueFormat, Wait,
};
use crate::session::DeviceSession;
use crate::sys::V4L2_EVENT_SRC_CH_RESOLUTION;
use m2m_core::error::{EngineError, Result};
use m2m_core::types::{FourCC, Rect};

/// How a mocked crop API answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CropBehavior {
    /// Read-back returns whatever was last set.
    Echo,
    /// Read-back returns this rectangle regardless of the request.
    ReadBack(Rect),
    /// The set ioctl fails with `EINVAL`.
    SetFails,
    /// The set ioctl succeeds, the get ioctl fails.
    GetFails,
}

#[derive(Clone, Debug)]
pub struct MockDeviceConfig {
    pub role: DeviceRole,
    pub path: PathBuf,
    /// Native capture size reported by `G_FMT`.
    pub capture_size: Rect,
    pub capture_fourcc: FourCC,
    /// Capture `S_FMT` replaces the native format (converter behaviour).
    pub capture_follows_request: bool,
    /// Number of leading capture `G_FMT` calls that fail.
    pub format_failures: u32,
    /// Number of leading `open` calls that fail.
    pub open_failures: u32,
    pub selection: CropBehavior,
    pub crop: CropBehavior,
    pub subscribe_supported: bool,
    /// Pending inputs the output queue accepts before `OutOfInputBuffers`.
    pub output_capacity: u32,
    pub capture_init_fails: bool,
    /// Base for the fake dmabuf descriptors of capture buffers.
    pub fd_base: i32,
}

impl MockDeviceConfig {
    pub fn decoder(size: Rect, fourcc: FourCC) -> Self {
        Self {
            role: DeviceRole::Decoder,
            path: PathBuf::from("/dev/mock-decoder"),
            capture_size: size,
            capture_fourcc: fourcc,
            capture_follows_request: false,
            format_failures: 0,
            open_failures: 0,
            selection: CropBehavior::Echo,
            crop: CropBehavior::Echo,
            subscribe_supported: true,
            output_capacity: 4,
            capture_init_fails: false,
            fd_base: 100,
        }
    }

    pub fn converter() -> Self {
        Self {
            role: DeviceRole::Converter,
            path: PathBuf::from("/dev/mock-converter"),
            capture_follows_request: true,
            subscribe_supported: false,
            fd_base: 200,
            ..Self::decoder(Rect::default(), FourCC::new(b"NV12"))
        }
    }
}

/// Call counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockStats {
    pub open_calls: u32,
    pub format_queries: u32,
    pub selection_calls: u32,
    pub crop_calls: u32,
    pub subscribe_calls: u32,
    pub stop_commands: u32,
    pub output_enqueued: u32,
    pub output_rejected: u32,
    pub imported_enqueued: u32,
    pub output_inits: u32,
    pub capture_inits: u32,
    pub capture_releases: u32,
    pub output_stream_on: u32,
    pub capture_stream_on: u32,
    pub capture_stream_off: u32,
    pub recycled: u32,
    pub frames_produced: u32,
    /// Stream on/off calls in order, as `"<queue>_on"` / `"<queue>_off"`.
    pub stream_log: Vec<&'static str>,
}

#[derive(Default)]
struct QueueModel {
    format: Option<QueueFormat>,
    memory: Option<MemoryModel>,
    count: u32,
    streaming: bool,
}

impl QueueModel {
    fn initialized(&self) -> bool {
        self.memory.is_some()
    }
}

struct PendingInput {
    timestamp: i64,
}

struct MockState {
    config: MockDeviceConfig,
    stats: MockStats,
    open: bool,
    subscribed: bool,
    events: VecDeque<DeviceEvent>,
    stopped: bool,
    native: (Rect, FourCC),
    selection: Option<Rect>,
    crop: Option<Rect>,
    output: QueueModel,
    capture: QueueModel,
    pending: VecDeque<PendingInput>,
    consumed: VecDeque<DequeuedBuffer>,
    free_capture: VecDeque<u32>,
    format_failures_left: u32,
    open_failures_left: u32,
}

impl MockState {
    fn queue(&mut self, direction: Direction) -> &mut QueueModel {
        match direction {
            Direction::Output => &mut self.output,
            Direction::Capture => &mut self.capture,
        }
    }

    fn capture_format(&self) -> QueueFormat {
        let (size, fourcc) = self.native;
        QueueFormat {
            size,
            fourcc,
            planes: vec![PlaneLayout {
                bytes_per_line: size.width,
                size_image: size.width * size.height * 3 / 2,
            }],
        }
    }

    fn produce_frame(&mut self) -> Option<DequeuedBuffer> {
        if !self.output.streaming || self.pending.is_empty() {
            return None;
        }
        let index = self.free_capture.pop_front()?;
        let input = self.pending.pop_front()?;
        self.stats.frames_produced += 1;
        self.consumed.push_back(DequeuedBuffer {
            index: self.stats.frames_produced - 1,
            timestamp: input.timestamp,
            planes: Vec::new(),
        });
        let (size, _) = self.native;
        Some(DequeuedBuffer {
            index,
            timestamp: input.timestamp,
            planes: vec![BufferPlane {
                fd: Some(self.config.fd_base + index as i32),
                offset: 0,
                pitch: size.width,
                bytes_used: 16,
                data: Some(Bytes::from(vec![(self.stats.frames_produced & 0xff) as u8; 16])),
            }],
        })
    }
}

fn einval(ioctl: &'static str) -> EngineError {
    EngineError::ioctl(ioctl, Errno::EINVAL)
}

fn crop_get(
    behavior: CropBehavior,
    last: Option<Rect>,
    fallback: Rect,
    ioctl: &'static str,
) -> Result<Rect> {
    match behavior {
        CropBehavior::Echo => Ok(last.unwrap_or(fallback)),
        CropBehavior::ReadBack(rect) => Ok(rect),
        CropBehavior::SetFails | CropBehavior::GetFails => Err(einval(ioctl)),
    }
}

/// Shared handle to one mocked device.
#[derive(Clone)]
pub struct MockM2m {
    state: Rc<RefCell<MockState>>,
}

impl MockM2m {
    pub fn new(config: MockDeviceConfig) -> Self {
        let state = MockState {
            stats: MockStats::default(),
            open: false,
            subscribed: false,
            events: VecDeque::new(),
            stopped: false,
            native: (config.capture_size, config.capture_fourcc),
            selection: None,
            crop: None,
            output: QueueModel::default(),
            capture: QueueModel::default(),
            pending: VecDeque::new(),
            consumed: VecDeque::new(),
            free_capture: VecDeque::new(),
            format_failures_left: config.format_failures,
            open_failures_left: config.open_failures,
            config,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn device(&self) -> Box<dyn DeviceControl> {
        Box::new(MockDevice {
            state: Rc::clone(&self.state),
        })
    }

    pub fn output_queue(&self) -> Box<dyn Queue> {
        Box::new(MockQueue {
            state: Rc::clone(&self.state),
            direction: Direction::Output,
        })
    }

    pub fn capture_queue(&self) -> Box<dyn Queue> {
        Box::new(MockQueue {
            state: Rc::clone(&self.state),
            direction: Direction::Capture,
        })
    }

    pub fn session(&self) -> DeviceSession {
        DeviceSession::new(self.device(), self.output_queue(), self.capture_queue())
    }

    /// Factory that yields a fresh session over this device on every call.
    pub fn session_factory(&self) -> Box<dyn FnMut() -> Result<DeviceSession>> {
        let hw = self.clone();
        Box::new(move || Ok(hw.session()))
    }

    pub fn stats(&self) -> MockStats {
        self.state.borrow().stats.clone()
    }

    /// Inputs accepted but not yet turned into frames.
    pub fn pending_inputs(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn capture_buffer_count(&self) -> u32 {
        self.state.borrow().capture.count
    }

    /// Capture buffers currently held outside the device.
    pub fn capture_buffers_out(&self) -> usize {
        let state = self.state.borrow();
        (state.capture.count as usize).saturating_sub(state.free_capture.len())
    }

    /// Switch the native capture format and raise a resolution-change event.
    pub fn change_source(&self, size: Rect, fourcc: FourCC) {
        let mut state = self.state.borrow_mut();
        state.native = (size, fourcc);
        state.events.push_back(DeviceEvent::SourceChange {
            changes: V4L2_EVENT_SRC_CH_RESOLUTION,
        });
    }

    pub fn push_event(&self, event: DeviceEvent) {
        self.state.borrow_mut().events.push_back(event);
    }
}

// ─── Device ──────────────────────────────────────────────────────────────

struct MockDevice {
    state: Rc<RefCell<MockState>>,
}

impl DeviceControl for MockDevice {
    fn role(&self) -> DeviceRole {
        self.state.borrow().config.role
    }

    fn open(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.open {
            return Ok(());
        }
        state.stats.open_calls += 1;
        if state.open_failures_left > 0 {
            state.open_failures_left -= 1;
            return Err(EngineError::DeviceOpen {
                path: state.config.path.clone(),
                source: Errno::EBUSY.into(),
            });
        }
        state.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    fn set_selection(&mut self, rect: Rect) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.stats.selection_calls += 1;
        if state.config.selection == CropBehavior::SetFails {
            return Err(einval("VIDIOC_S_SELECTION"));
        }
        state.selection = Some(rect);
        Ok(())
    }

    fn selection(&mut self) -> Result<Rect> {
        let state = self.state.borrow();
        crop_get(
            state.config.selection,
            state.selection,
            state.native.0,
            "VIDIOC_G_SELECTION",
        )
    }

    fn set_crop(&mut self, rect: Rect) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.stats.crop_calls += 1;
        if state.config.crop == CropBehavior::SetFails {
            return Err(einval("VIDIOC_S_CROP"));
        }
        state.crop = Some(rect);
        Ok(())
    }

    fn crop(&mut self) -> Result<Rect> {
        let state = self.state.borrow();
        crop_get(state.config.crop, state.crop, state.native.0, "VIDIOC_G_CROP")
    }

    fn subscribe_source_change(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.stats.subscribe_calls += 1;
        if !state.config.subscribe_supported {
            return Err(einval("VIDIOC_SUBSCRIBE_EVENT"));
        }
        state.subscribed = true;
        Ok(())
    }

    fn dequeue_event(&mut self) -> Result<Option<DeviceEvent>> {
        let mut state = self.state.borrow_mut();
        if !state.subscribed {
            return Ok(None);
        }
        Ok(state.events.pop_front())
    }

    fn stop_decoder(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.stats.stop_commands += 1;
        state.stopped = true;
        Ok(())
    }
}

// ─── Queues ──────────────────────────────────────────────────────────────

struct MockQueue {
    state: Rc<RefCell<MockState>>,
    direction: Direction,
}

impl Queue for MockQueue {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn set_format(&mut self, size: Rect, fourcc: FourCC) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if self.direction == Direction::Capture && state.config.capture_follows_request {
            state.native = (size, fourcc);
        }
        state.queue(self.direction).format = Some(QueueFormat::new(size, fourcc));
        Ok(())
    }

    fn format(&mut self) -> Result<QueueFormat> {
        let mut state = self.state.borrow_mut();
        match self.direction {
            Direction::Output => state
                .output
                .format
                .clone()
                .ok_or_else(|| einval("VIDIOC_G_FMT")),
            Direction::Capture => {
                state.stats.format_queries += 1;
                if state.format_failures_left > 0 {
                    state.format_failures_left -= 1;
                    return Err(EngineError::ioctl("VIDIOC_G_FMT", Errno::EAGAIN));
                }
                Ok(state.capture_format())
            }
        }
    }

    fn init(
        &mut self,
        memory: MemoryModel,
        count: u32,
        import: Option<&ImportSource>,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let granted = match (memory, import) {
            (MemoryModel::DmaBufImport, Some(source)) => source.buffer_count,
            (MemoryModel::DmaBufImport, None) => {
                return Err(EngineError::Queue(
                    "dmabuf import requires a source pool".into(),
                ));
            }
            (MemoryModel::Mmap, _) => count,
        };
        match self.direction {
            Direction::Output => state.stats.output_inits += 1,
            Direction::Capture => {
                state.stats.capture_inits += 1;
                if state.config.capture_init_fails {
                    return Err(EngineError::Allocation(format!(
                        "REQBUFS({count}) refused"
                    )));
                }
                state.free_capture = (0..granted).collect();
            }
        }
        let queue = state.queue(self.direction);
        queue.memory = Some(memory);
        queue.count = granted;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.state.borrow_mut().queue(self.direction).initialized()
    }

    fn buffer_count(&self) -> u32 {
        self.state.borrow_mut().queue(self.direction).count
    }

    fn release(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.queue(self.direction).streaming {
            return Err(EngineError::Queue(format!(
                "release of streaming {} queue",
                self.direction.label()
            )));
        }
        if self.direction == Direction::Capture {
            state.stats.capture_releases += 1;
            state.free_capture.clear();
        }
        let queue = state.queue(self.direction);
        queue.memory = None;
        queue.count = 0;
        Ok(())
    }

    fn set_streaming(&mut self, on: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if on && !state.queue(self.direction).initialized() {
            return Err(einval("VIDIOC_STREAMON"));
        }
        let entry = match (self.direction, on) {
            (Direction::Output, true) => {
                state.stats.output_stream_on += 1;
                "output_on"
            }
            (Direction::Output, false) => "output_off",
            (Direction::Capture, true) => {
                state.stats.capture_stream_on += 1;
                "capture_on"
            }
            (Direction::Capture, false) => {
                state.stats.capture_stream_off += 1;
                "capture_off"
            }
        };
        state.stats.stream_log.push(entry);
        state.queue(self.direction).streaming = on;
        Ok(())
    }

    fn enqueue(&mut self, buffer: QueueBuffer<'_>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match (self.direction, buffer) {
            (Direction::Output, QueueBuffer::Bitstream(packet)) => {
                if state.pending.len() as u32 >= state.config.output_capacity {
                    state.stats.output_rejected += 1;
                    return Err(EngineError::OutOfInputBuffers);
                }
                state.stats.output_enqueued += 1;
                state.pending.push_back(PendingInput {
                    timestamp: packet.pts,
                });
                Ok(())
            }
            (Direction::Output, QueueBuffer::Imported(imported)) => {
                if state.output.memory != Some(MemoryModel::DmaBufImport) {
                    return Err(EngineError::Queue(
                        "imported buffer on a non-import queue".into(),
                    ));
                }
                if state.pending.len() as u32 >= state.output.count {
                    return Err(EngineError::OutOfInputBuffers);
                }
                state.stats.imported_enqueued += 1;
                state.pending.push_back(PendingInput {
                    timestamp: imported.timestamp(),
                });
                Ok(())
            }
            (Direction::Capture, QueueBuffer::Recycle(index)) => {
                if index >= state.capture.count || state.free_capture.contains(&index) {
                    return Err(EngineError::Queue(format!(
                        "capture buffer {index} is not held by the caller"
                    )));
                }
                state.stats.recycled += 1;
                state.free_capture.push_back(index);
                Ok(())
            }
            (direction, other) => Err(EngineError::Queue(format!(
                "{other:?} cannot be queued on the {} queue",
                direction.label()
            ))),
        }
    }

    fn dequeue(&mut self, _wait: Wait) -> Result<Dequeued> {
        let mut state = self.state.borrow_mut();
        match self.direction {
            Direction::Output => Ok(state
                .consumed
                .pop_front()
                .map_or(Dequeued::Retry, Dequeued::Buffer)),
            Direction::Capture => {
                if !state.capture.streaming {
                    return Err(einval("VIDIOC_DQBUF"));
                }
                if let Some(buffer) = state.produce_frame() {
                    return Ok(Dequeued::Buffer(buffer));
                }
                if state.stopped && state.pending.is_empty() {
                    return Ok(Dequeued::EndOfStream);
                }
                Ok(Dequeued::Retry)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m2m_core::codec_traits::BitstreamPacket;

    #[test]
    fn frames_follow_inputs_once_both_queues_stream() {
        let hw = MockM2m::new(MockDeviceConfig::decoder(
            Rect::new(64, 64),
            FourCC::new(b"NM12"),
        ));
        let mut output = hw.output_queue();
        let mut capture = hw.capture_queue();
        output
            .init(MemoryModel::Mmap, 4, None)
            .expect("output init");
        capture
            .init(MemoryModel::Mmap, 2, None)
            .expect("capture init");
        output
            .enqueue(QueueBuffer::Bitstream(&BitstreamPacket::new(vec![1], 7)))
            .expect("enqueue");
        output.set_streaming(true).expect("output on");
        capture.set_streaming(true).expect("capture on");

        let Dequeued::Buffer(frame) = capture.dequeue(Wait::Block).expect("dequeue") else {
            panic!("expected a frame");
        };
        assert_eq!(frame.timestamp, 7);
        assert!(matches!(
            capture.dequeue(Wait::Block).expect("dequeue"),
            Dequeued::Retry
        ));
        assert_eq!(hw.capture_buffers_out(), 1);
        capture
            .enqueue(QueueBuffer::Recycle(frame.index))
            .expect("recycle");
        assert_eq!(hw.capture_buffers_out(), 0);
    }

    #[test]
    fn full_output_queue_reports_backpressure() {
        let hw = MockM2m::new(MockDeviceConfig {
            output_capacity: 1,
            ..MockDeviceConfig::decoder(Rect::new(64, 64), FourCC::new(b"NM12"))
        });
        let mut output = hw.output_queue();
        let packet = BitstreamPacket::new(vec![1], 0);
        output.enqueue(QueueBuffer::Bitstream(&packet)).expect("first");
        let err = output
            .enqueue(QueueBuffer::Bitstream(&packet))
            .expect_err("second must bounce");
        assert!(matches!(err, EngineError::OutOfInputBuffers));
        assert_eq!(hw.stats().output_rejected, 1);
    }

    #[test]
    fn converter_capture_adopts_requested_format() {
        let hw = MockM2m::new(MockDeviceConfig::converter());
        let mut capture = hw.capture_queue();
        capture
            .set_format(Rect::new(1280, 720), FourCC::new(b"YU12"))
            .expect("set");
        let format = capture.format().expect("get");
        assert_eq!(format.size, Rect::new(1280, 720));
        assert_eq!(format.fourcc, FourCC::new(b"YU12"));
    }
}
