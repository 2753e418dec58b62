//! One device plus its two queues: format and crop negotiation, streaming.
//!
//! # Crop negotiation
//!
//! Driver generations disagree on which crop ioctl they implement, so the
//! session walks an ordered list of [`CropStrategy`] values and keeps the
//! first read-back that succeeds.  When every strategy fails the visible
//! size stays at whatever `VIDIOC_G_FMT` reported, which still yields
//! usable (uncropped) frames.

use tracing::{debug, warn};

use crate::device::{DeviceControl, DeviceRole};
use crate::queue::{
    Direction, ImportSource, MemoryModel, Queue, QueueEvent, QueueFormat, QueueState,
};
use m2m_core::error::{EngineError, Result};
use m2m_core::types::{FourCC, PixelFormat, Rect};

// ─── Crop strategies ─────────────────────────────────────────────────────

/// One set-then-read-back crop API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CropStrategy {
    /// `VIDIOC_S_SELECTION` / `VIDIOC_G_SELECTION`.
    Selection,
    /// `VIDIOC_S_CROP` / `VIDIOC_G_CROP`.
    LegacyCrop,
}

impl CropStrategy {
    pub const DEFAULT_ORDER: [CropStrategy; 2] = [Self::Selection, Self::LegacyCrop];

    pub fn label(self) -> &'static str {
        match self {
            Self::Selection => "selection",
            Self::LegacyCrop => "legacy_crop",
        }
    }

    /// Apply `requested` and return the rectangle the device actually chose.
    pub fn negotiate(self, device: &mut dyn DeviceControl, requested: Rect) -> Result<Rect> {
        match self {
            Self::Selection => {
                device.set_selection(requested)?;
                device.selection()
            }
            Self::LegacyCrop => {
                device.set_crop(requested)?;
                device.crop()
            }
        }
    }
}

/// Try `strategies` in order; the first successful read-back wins.
pub fn negotiate_crop(
    device: &mut dyn DeviceControl,
    requested: Rect,
    strategies: &[CropStrategy],
) -> Option<(CropStrategy, Rect)> {
    for strategy in strategies {
        match strategy.negotiate(device, requested) {
            Ok(rect) => {
                debug!(
                    role = device.role().label(),
                    strategy = strategy.label(),
                    %requested,
                    negotiated = %rect,
                    "Crop negotiated"
                );
                return Some((*strategy, rect));
            }
            Err(err) => {
                warn!(
                    role = device.role().label(),
                    strategy = strategy.label(),
                    error = %err,
                    "Crop strategy failed, trying next"
                );
            }
        }
    }
    None
}

// ─── Device session ──────────────────────────────────────────────────────

/// A device file paired with its bitstream/input queue and its frame queue.
pub struct DeviceSession {
    device: Box<dyn DeviceControl>,
    output: Box<dyn Queue>,
    capture: Box<dyn Queue>,
    output_state: QueueState,
    capture_state: QueueState,
    coded_size: Rect,
    visible_size: Rect,
    capture_format: Option<QueueFormat>,
    pixel_format: PixelFormat,
    crop_strategies: Vec<CropStrategy>,
    /// Bumped every time the capture pool is released.
    capture_generation: u32,
}

impl DeviceSession {
    pub fn new(
        device: Box<dyn DeviceControl>,
        output: Box<dyn Queue>,
        capture: Box<dyn Queue>,
    ) -> Self {
        Self {
            device,
            output,
            capture,
            output_state: QueueState::Idle,
            capture_state: QueueState::Idle,
            coded_size: Rect::default(),
            visible_size: Rect::default(),
            capture_format: None,
            pixel_format: PixelFormat::None,
            crop_strategies: CropStrategy::DEFAULT_ORDER.to_vec(),
            capture_generation: 0,
        }
    }

    pub fn with_crop_strategies(mut self, strategies: Vec<CropStrategy>) -> Self {
        self.crop_strategies = strategies;
        self
    }

    pub fn role(&self) -> DeviceRole {
        self.device.role()
    }

    pub fn device_mut(&mut self) -> &mut dyn DeviceControl {
        self.device.as_mut()
    }

    pub fn output_mut(&mut self) -> &mut dyn Queue {
        self.output.as_mut()
    }

    pub fn capture_mut(&mut self) -> &mut dyn Queue {
        self.capture.as_mut()
    }

    pub fn state(&self, direction: Direction) -> QueueState {
        match direction {
            Direction::Output => self.output_state,
            Direction::Capture => self.capture_state,
        }
    }

    pub fn coded_size(&self) -> Rect {
        self.coded_size
    }

    pub fn visible_size(&self) -> Rect {
        self.visible_size
    }

    pub fn capture_format(&self) -> Option<&QueueFormat> {
        self.capture_format.as_ref()
    }

    /// Caller-facing format of the capture queue, [`PixelFormat::None`] until queried.
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn capture_generation(&self) -> u32 {
        self.capture_generation
    }

    /// Buffers granted to the capture pool, zero before allocation.
    pub fn capture_buffer_count(&self) -> u32 {
        self.capture.buffer_count()
    }

    fn advance(&mut self, direction: Direction, event: QueueEvent) -> Result<()> {
        let slot = match direction {
            Direction::Output => &mut self.output_state,
            Direction::Capture => &mut self.capture_state,
        };
        *slot = slot.apply(event)?;
        Ok(())
    }

    /// Set the input-side format and allocate its pool.
    ///
    /// Skips allocation when the queue already holds buffers so a retried
    /// configuration does not leak the previous pool.
    pub fn configure_output(
        &mut self,
        size: Rect,
        fourcc: FourCC,
        memory: MemoryModel,
        count: u32,
        import: Option<&ImportSource>,
    ) -> Result<()> {
        if !self.output.is_initialized() {
            self.output.set_format(size, fourcc)?;
            self.output.init(memory, count, import)?;
            debug!(
                role = self.role().label(),
                %size,
                %fourcc,
                ?memory,
                buffers = self.output.buffer_count(),
                "Output queue configured"
            );
        }
        self.advance(Direction::Output, QueueEvent::Configure)
    }

    /// Ask the device for a capture format ahead of querying it back.
    pub fn request_capture_format(&mut self, size: Rect, fourcc: FourCC) -> Result<()> {
        self.capture.set_format(size, fourcc)
    }

    /// Query the capture format and map it to the caller-facing enum.
    ///
    /// Resets both coded and visible size to the reported dimensions.
    pub fn query_capture(&mut self) -> Result<PixelFormat> {
        let format = self.capture.format()?;
        let pixel_format = PixelFormat::from_fourcc(format.fourcc);
        debug!(
            role = self.role().label(),
            size = %format.size,
            fourcc = %format.fourcc,
            format = %pixel_format,
            "Capture format queried"
        );
        self.coded_size = format.size;
        self.visible_size = format.size;
        self.pixel_format = pixel_format;
        self.capture_format = Some(format);
        Ok(pixel_format)
    }

    /// Negotiate the visible rectangle; returns the resulting visible size.
    pub fn negotiate_crop(&mut self, requested: Rect) -> Rect {
        match negotiate_crop(self.device.as_mut(), requested, &self.crop_strategies) {
            Some((_, rect)) => self.visible_size = rect,
            None => warn!(
                role = self.role().label(),
                %requested,
                visible = %self.visible_size,
                "No crop API accepted the request; keeping the reported size"
            ),
        }
        self.visible_size
    }

    /// Query the capture format, then negotiate crop against `requested`.
    pub fn negotiate_capture(&mut self, requested: Rect) -> Result<(PixelFormat, Rect)> {
        let format = self.query_capture()?;
        let visible = self.negotiate_crop(requested);
        Ok((format, visible))
    }

    /// Allocate the capture pool.  Any failure is reported as an allocation error.
    pub fn init_capture(
        &mut self,
        memory: MemoryModel,
        count: u32,
        import: Option<&ImportSource>,
    ) -> Result<()> {
        if !self.capture.is_initialized() {
            self.capture
                .init(memory, count, import)
                .map_err(|err| match err {
                    EngineError::Allocation(_) => err,
                    other => EngineError::Allocation(format!(
                        "{} capture pool: {other}",
                        self.device.role().label()
                    )),
                })?;
            debug!(
                role = self.role().label(),
                buffers = self.capture.buffer_count(),
                "Capture queue allocated"
            );
        }
        self.advance(Direction::Capture, QueueEvent::Configure)
    }

    /// `STREAMON`.  No-op for a queue that is already streaming.
    pub fn start(&mut self, direction: Direction) -> Result<()> {
        if self.state(direction).is_streaming() {
            return Ok(());
        }
        // Validate before touching the device.
        self.state(direction).apply(QueueEvent::StreamOn)?;
        self.queue_mut(direction).set_streaming(true)?;
        self.advance(direction, QueueEvent::StreamOn)?;
        debug!(
            role = self.role().label(),
            queue = direction.label(),
            "Streaming started"
        );
        Ok(())
    }

    /// `STREAMOFF`.  No-op for a queue that is not streaming.
    pub fn stop(&mut self, direction: Direction) -> Result<()> {
        if !self.state(direction).is_streaming() {
            return Ok(());
        }
        self.queue_mut(direction).set_streaming(false)?;
        self.advance(direction, QueueEvent::StreamOff)
    }

    /// Stop the capture queue and free its pool so it can be renegotiated.
    pub fn release_capture(&mut self) -> Result<()> {
        self.stop(Direction::Capture)?;
        self.capture.release()?;
        self.advance(Direction::Capture, QueueEvent::Release)?;
        self.capture_generation = self.capture_generation.wrapping_add(1);
        self.capture_format = None;
        Ok(())
    }

    fn queue_mut(&mut self, direction: Direction) -> &mut dyn Queue {
        match direction {
            Direction::Output => self.output.as_mut(),
            Direction::Capture => self.capture.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CropBehavior, MockDeviceConfig, MockM2m};

    fn decoder_session(hw: &MockM2m) -> DeviceSession {
        DeviceSession::new(hw.device(), hw.output_queue(), hw.capture_queue())
    }

    #[test]
    fn selection_readback_is_authoritative() {
        let hw = MockM2m::new(MockDeviceConfig {
            selection: CropBehavior::ReadBack(Rect::new(1920, 1088)),
            ..MockDeviceConfig::decoder(Rect::new(1920, 1088), FourCC::new(b"NM12"))
        });
        let mut session = decoder_session(&hw);
        let (format, visible) = session
            .negotiate_capture(Rect::new(1920, 1080))
            .expect("negotiate");
        assert_eq!(format, PixelFormat::Nv12);
        assert_eq!(visible, Rect::new(1920, 1088));
        assert_eq!(hw.stats().crop_calls, 0);
    }

    #[test]
    fn legacy_crop_used_only_after_selection_fails() {
        let hw = MockM2m::new(MockDeviceConfig {
            selection: CropBehavior::SetFails,
            crop: CropBehavior::ReadBack(Rect::new(1280, 720)),
            ..MockDeviceConfig::decoder(Rect::new(1280, 736), FourCC::new(b"NM12"))
        });
        let mut session = decoder_session(&hw);
        let (_, visible) = session
            .negotiate_capture(Rect::new(1280, 720))
            .expect("negotiate");
        assert_eq!(visible, Rect::new(1280, 720));
        assert_eq!(hw.stats().selection_calls, 1);
        assert_eq!(hw.stats().crop_calls, 1);
    }

    #[test]
    fn both_strategies_failing_keeps_queried_size() {
        let hw = MockM2m::new(MockDeviceConfig {
            selection: CropBehavior::GetFails,
            crop: CropBehavior::SetFails,
            ..MockDeviceConfig::decoder(Rect::new(640, 368), FourCC::new(b"NM12"))
        });
        let mut session = decoder_session(&hw);
        let (_, visible) = session
            .negotiate_capture(Rect::new(640, 360))
            .expect("degraded but functional");
        assert_eq!(visible, Rect::new(640, 368));
        assert_eq!(session.coded_size(), Rect::new(640, 368));
    }

    #[test]
    fn strategy_order_is_configurable() {
        let hw = MockM2m::new(MockDeviceConfig {
            selection: CropBehavior::ReadBack(Rect::new(10, 10)),
            crop: CropBehavior::ReadBack(Rect::new(20, 20)),
            ..MockDeviceConfig::decoder(Rect::new(32, 32), FourCC::new(b"NM12"))
        });
        let mut session = decoder_session(&hw).with_crop_strategies(vec![CropStrategy::LegacyCrop]);
        session.query_capture().expect("query");
        assert_eq!(session.negotiate_crop(Rect::new(20, 20)), Rect::new(20, 20));
        assert_eq!(hw.stats().selection_calls, 0);
    }

    #[test]
    fn query_failure_surfaces_as_device_query_error() {
        let hw = MockM2m::new(MockDeviceConfig {
            format_failures: 1,
            ..MockDeviceConfig::decoder(Rect::new(32, 32), FourCC::new(b"NM12"))
        });
        let mut session = decoder_session(&hw);
        let err = session.query_capture().expect_err("first query fails");
        assert_eq!(err.error_code(), 100);
        assert!(session.query_capture().is_ok());
    }

    #[test]
    fn start_is_idempotent_and_requires_configuration() {
        let hw = MockM2m::new(MockDeviceConfig::decoder(
            Rect::new(32, 32),
            FourCC::new(b"NM12"),
        ));
        let mut session = decoder_session(&hw);
        assert!(session.start(Direction::Capture).is_err());

        session
            .init_capture(MemoryModel::Mmap, 8, None)
            .expect("allocate");
        session.start(Direction::Capture).expect("first start");
        session.start(Direction::Capture).expect("second start");
        assert_eq!(hw.stats().capture_stream_on, 1);
        assert_eq!(session.state(Direction::Capture), QueueState::Streaming);
    }

    #[test]
    fn capture_init_failures_become_allocation_errors() {
        let hw = MockM2m::new(MockDeviceConfig {
            capture_init_fails: true,
            ..MockDeviceConfig::decoder(Rect::new(32, 32), FourCC::new(b"NM12"))
        });
        let mut session = decoder_session(&hw);
        let err = session
            .init_capture(MemoryModel::Mmap, 8, None)
            .expect_err("allocation must fail");
        assert!(matches!(err, EngineError::Allocation(_)));
        assert_eq!(session.state(Direction::Capture), QueueState::Idle);
    }

    #[test]
    fn releasing_capture_bumps_generation() {
        let hw = MockM2m::new(MockDeviceConfig::decoder(
            Rect::new(32, 32),
            FourCC::new(b"NM12"),
        ));
        let mut session = decoder_session(&hw);
        session
            .init_capture(MemoryModel::Mmap, 8, None)
            .expect("allocate");
        session.start(Direction::Capture).expect("start");
        session.release_capture().expect("release");
        assert_eq!(session.state(Direction::Capture), QueueState::Idle);
        assert_eq!(session.capture_generation(), 1);
    }
}
