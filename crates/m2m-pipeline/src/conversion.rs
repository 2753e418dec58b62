//! Pixel-format conversion stage spliced behind the decoder.
//!
//! # Architecture
//!
//! ```text
//!  decoder capture ──dequeue──▸ ImportedBuffer ──▸ converter output (dmabuf import)
//!        ▲                                              │
//!        │                                         converter
//!        │                                              ▼
//!        └──── Recycle(index) ◂── borrowed FIFO ◂── converter output done
//!                                                  converter capture ──▸ Frame
//! ```
//!
//! The converter reads the decoder's capture buffers in place.  Every
//! borrowed decoder buffer is remembered in FIFO order together with the
//! decoder pool generation it came from; when the converter hands the
//! input back, the decoder buffer is recycled unless its pool has since
//! been released.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use m2m_core::error::{EngineError, Result};
use m2m_core::types::{PixelFormat, Rect};
use m2m_v4l2::queue::{
    Dequeued, Direction, ImportSource, ImportedBuffer, MemoryModel, QueueBuffer, Wait,
};
use m2m_v4l2::session::DeviceSession;

/// Builds the converter's device session on first use.
pub type SessionFactory = Box<dyn FnMut() -> Result<DeviceSession>>;

/// Whether frames leave the decoder directly or through a converter.
///
/// Moves from `Direct` to `Converting` at most once and never back.
pub enum Conversion {
    Direct,
    Converting(Box<ConversionStage>),
}

impl Conversion {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Converting(_))
    }

    pub fn stage(&self) -> Option<&ConversionStage> {
        match self {
            Self::Direct => None,
            Self::Converting(stage) => Some(stage),
        }
    }
}

/// Native decoder output differs from what the caller asked for.
///
/// Opaque DRM-PRIME output never needs conversion: the caller gets the
/// decoder's own surfaces.
pub fn needs_conversion(native: PixelFormat, requested: PixelFormat) -> bool {
    requested != PixelFormat::DrmPrime && native != requested
}

#[derive(Clone, Copy, Debug)]
struct Borrowed {
    index: u32,
    generation: u32,
}

fn step<T>(step: &'static str, result: Result<T>) -> Result<T> {
    result.map_err(|err| EngineError::ConverterConfig {
        step,
        reason: err.to_string(),
    })
}

pub struct ConversionStage {
    session: DeviceSession,
    borrowed: VecDeque<Borrowed>,
    in_flight: u32,
}

impl ConversionStage {
    pub fn new(session: DeviceSession) -> Self {
        Self {
            session,
            borrowed: VecDeque::new(),
            in_flight: 0,
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut DeviceSession {
        &mut self.session
    }

    /// Converter capture is streaming: bring-up is complete.
    pub fn is_live(&self) -> bool {
        self.session.state(Direction::Capture).is_streaming()
    }

    /// Configure and start the converter against the decoder's capture pool.
    ///
    /// Steps that already succeeded on an earlier attempt (device open, pool
    /// allocation) are skipped, so a failed bring-up can be retried as a
    /// whole.  Returns the converter's caller-facing format and visible size.
    pub fn bring_up(
        &mut self,
        decoder: &DeviceSession,
        requested_size: Rect,
        requested_format: PixelFormat,
        capture_buffers: u32,
    ) -> Result<(PixelFormat, Rect)> {
        if self.is_live() {
            return Err(EngineError::InvariantViolation(
                "converter bring-up requested while it is already streaming".into(),
            ));
        }
        debug!(%requested_size, %requested_format, "Configuring converter");

        // 1. The converter consumes exactly what the decoder produces.
        let format = decoder
            .capture_format()
            .cloned()
            .ok_or_else(|| EngineError::ConverterConfig {
                step: "import",
                reason: "decoder capture format is not known yet".into(),
            })?;
        let import = ImportSource {
            format,
            buffer_count: decoder.capture_buffer_count(),
        };

        // 2. Open and probe.
        step("open", self.session.device_mut().open())?;

        // 3. Input side imports the decoder's buffers.
        step(
            "output_init",
            self.session.configure_output(
                import.format.size,
                import.format.fourcc,
                MemoryModel::DmaBufImport,
                import.buffer_count,
                Some(&import),
            ),
        )?;

        // 4. Ask for the caller's layout, then read back what the device chose.
        let fourcc = requested_format
            .fourcc()
            .ok_or_else(|| EngineError::ConverterConfig {
                step: "capture_format",
                reason: format!("no device fourcc for {requested_format}"),
            })?;
        step(
            "capture_format",
            self.session.request_capture_format(requested_size, fourcc),
        )?;
        let converted = step("capture_format", self.session.query_capture())?;

        // 5. Crop against the caller's size, not the decoder's coded size.
        let visible = self.session.negotiate_crop(requested_size);

        // 6. Regular buffers for the converted frames.
        step(
            "capture_init",
            self.session
                .init_capture(MemoryModel::Mmap, capture_buffers, None),
        )?;

        // 7. Input must stream before output can produce anything.
        step("output_stream_on", self.session.start(Direction::Output))?;
        step("capture_stream_on", self.session.start(Direction::Capture))?;

        info!(
            format = %converted,
            visible = %visible,
            imported = import.buffer_count,
            "Converter streaming"
        );
        Ok((converted, visible))
    }

    /// Give decoder buffers the converter has finished with back to the decoder.
    fn reclaim(&mut self, decoder: &mut DeviceSession) -> Result<()> {
        loop {
            match self.session.output_mut().dequeue(Wait::Poll)? {
                Dequeued::Buffer(_) => {
                    let Some(slot) = self.borrowed.pop_front() else {
                        return Err(EngineError::InvariantViolation(
                            "converter returned a buffer it never borrowed".into(),
                        ));
                    };
                    if slot.generation == decoder.capture_generation() {
                        decoder
                            .capture_mut()
                            .enqueue(QueueBuffer::Recycle(slot.index))?;
                    } else {
                        debug!(index = slot.index, "Dropping borrowed buffer from a released pool");
                    }
                }
                Dequeued::Retry | Dequeued::EndOfStream => return Ok(()),
            }
        }
    }

    /// Move one decoded buffer through the converter and dequeue its result.
    ///
    /// End-of-stream on the decoder capture ends the converted stream too.
    pub fn relay(&mut self, decoder: &mut DeviceSession) -> Result<Dequeued> {
        self.reclaim(decoder)?;

        if self.in_flight == 0 {
            if !decoder.state(Direction::Capture).is_streaming() {
                return Ok(Dequeued::Retry);
            }
            match decoder.capture_mut().dequeue(Wait::Block)? {
                Dequeued::Buffer(buffer) => {
                    let imported = ImportedBuffer::borrow(&buffer);
                    if let Err(err) = self
                        .session
                        .output_mut()
                        .enqueue(QueueBuffer::Imported(imported))
                    {
                        decoder
                            .capture_mut()
                            .enqueue(QueueBuffer::Recycle(buffer.index))?;
                        return Err(err);
                    }
                    self.borrowed.push_back(Borrowed {
                        index: buffer.index,
                        generation: decoder.capture_generation(),
                    });
                    self.in_flight += 1;
                }
                other => return Ok(other),
            }
        }

        let converted = self.session.capture_mut().dequeue(Wait::Block)?;
        if matches!(converted, Dequeued::Buffer(_)) {
            self.in_flight -= 1;
        }
        Ok(converted)
    }

    /// Stop both converter queues.  Errors are logged, not returned.
    pub fn shutdown(&mut self) {
        for direction in [Direction::Capture, Direction::Output] {
            if let Err(err) = self.session.stop(direction) {
                warn!(queue = direction.label(), error = %err, "Converter stream-off failed");
            }
        }
        self.borrowed.clear();
        self.in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m2m_core::types::FourCC;
    use m2m_v4l2::mock::{MockDeviceConfig, MockM2m};

    fn decoder_with_pool(hw: &MockM2m) -> DeviceSession {
        let mut decoder = hw.session();
        decoder.query_capture().expect("query");
        decoder
            .init_capture(MemoryModel::Mmap, 8, None)
            .expect("allocate");
        decoder
    }

    #[test]
    fn opaque_output_never_needs_conversion() {
        assert!(!needs_conversion(PixelFormat::Nv12Tiled, PixelFormat::DrmPrime));
        assert!(!needs_conversion(PixelFormat::Nv12, PixelFormat::Nv12));
        assert!(needs_conversion(PixelFormat::Nv12Tiled, PixelFormat::Nv12));
        assert!(needs_conversion(PixelFormat::None, PixelFormat::Yuv420p));
    }

    #[test]
    fn bring_up_imports_decoder_pool_and_starts_output_first() {
        let dec = MockM2m::new(MockDeviceConfig::decoder(
            Rect::new(1280, 736),
            FourCC::new(b"TM12"),
        ));
        let conv = MockM2m::new(MockDeviceConfig::converter());
        let decoder = decoder_with_pool(&dec);

        let mut stage = ConversionStage::new(conv.session());
        let (format, visible) = stage
            .bring_up(&decoder, Rect::new(1280, 720), PixelFormat::Nv12, 8)
            .expect("bring-up");
        assert_eq!(format, PixelFormat::Nv12);
        assert_eq!(visible, Rect::new(1280, 720));
        assert!(stage.is_live());

        let stats = conv.stats();
        assert_eq!(stats.stream_log, vec!["output_on", "capture_on"]);
        assert_eq!(stats.open_calls, 1);
    }

    #[test]
    fn bring_up_while_live_is_rejected() {
        let dec = MockM2m::new(MockDeviceConfig::decoder(
            Rect::new(64, 64),
            FourCC::new(b"TM12"),
        ));
        let conv = MockM2m::new(MockDeviceConfig::converter());
        let decoder = decoder_with_pool(&dec);
        let mut stage = ConversionStage::new(conv.session());
        stage
            .bring_up(&decoder, Rect::new(64, 64), PixelFormat::Nv12, 8)
            .expect("first bring-up");

        let err = stage
            .bring_up(&decoder, Rect::new(64, 64), PixelFormat::Nv12, 8)
            .expect_err("second bring-up must be refused");
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert_eq!(conv.stats().capture_stream_on, 1);
    }

    #[test]
    fn failed_step_is_reported_with_its_name() {
        let dec = MockM2m::new(MockDeviceConfig::decoder(
            Rect::new(64, 64),
            FourCC::new(b"TM12"),
        ));
        let conv = MockM2m::new(MockDeviceConfig {
            open_failures: 1,
            ..MockDeviceConfig::converter()
        });
        let decoder = decoder_with_pool(&dec);
        let mut stage = ConversionStage::new(conv.session());

        let err = stage
            .bring_up(&decoder, Rect::new(64, 64), PixelFormat::Nv12, 8)
            .expect_err("open fails once");
        match err {
            EngineError::ConverterConfig { step, .. } => assert_eq!(step, "open"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!stage.is_live());
        stage
            .bring_up(&decoder, Rect::new(64, 64), PixelFormat::Nv12, 8)
            .expect("retry succeeds");
    }

    #[test]
    fn bring_up_needs_a_known_decoder_format() {
        let dec = MockM2m::new(MockDeviceConfig::decoder(
            Rect::new(64, 64),
            FourCC::new(b"TM12"),
        ));
        let conv = MockM2m::new(MockDeviceConfig::converter());
        let decoder = dec.session();
        let mut stage = ConversionStage::new(conv.session());
        let err = stage
            .bring_up(&decoder, Rect::new(64, 64), PixelFormat::Nv12, 8)
            .expect_err("no decoder format yet");
        assert_eq!(err.error_code(), 300);
        assert_eq!(conv.stats().open_calls, 0);
    }
}
