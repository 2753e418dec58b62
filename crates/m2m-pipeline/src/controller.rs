//! Decode pipeline controller.
//!
//! Owns the decoder [`DeviceSession`] and, once the decoder's native
//! capture format turns out to differ from the requested one, a
//! [`ConversionStage`].  Every [`receive_frame`](FrameDecoder::receive_frame)
//! call makes as much progress as it can and returns: a frame, a retry
//! signal, end-of-stream or a fatal error.
//!
//! # Pull protocol
//!
//! ```text
//! receive_frame
//!   ├─ reclaim returned leases, poll device events (source change)
//!   ├─ not draining: pending packet or source.read_packet()
//!   │     ├─ None ────────▸ draining = true, STOP command (once)
//!   │     └─ Some(packet) ─▸ enqueue (full ⇒ keep as pending)
//!   │                        └─ non-empty ⇒ try_start
//!   ├─ output not streaming yet but bitstream queued ⇒ try_start again
//!   └─ dequeue from the effective output (converter capture or decoder capture)
//! ```
//!
//! # Error policy
//!
//! Transient failures inside `try_start` (format query, converter
//! configuration, stream-on; see [`EngineError::is_transient`]) are logged
//! and reported as [`ReceiveOutcome::Retry`]; a later call runs the whole
//! start sequence again.  Everything else, allocation failures included,
//! is returned as `Err`.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::{debug, info, warn};

use m2m_core::codec_traits::{BitstreamPacket, BitstreamSource, FrameDecoder};
use m2m_core::config::DecoderConfig;
use m2m_core::error::{EngineError, Result};
use m2m_core::types::{
    BufferLease, BufferOrigin, DrmDescriptor, DrmObject, DrmPlane, FourCC, Frame, FramePayload,
    FramePlane, PixelFormat, ReceiveOutcome, Rect, ReturnedBuffer,
};
use m2m_v4l2::device::DeviceEvent;
use m2m_v4l2::queue::{
    Dequeued, DequeuedBuffer, Direction, MemoryModel, QueueBuffer, QueueState, Wait,
};
use m2m_v4l2::session::DeviceSession;
use m2m_v4l2::sys::V4L2_EVENT_SRC_CH_RESOLUTION;

use crate::conversion::{Conversion, ConversionStage, SessionFactory, needs_conversion};
use crate::metrics::{DecodeMetrics, enforce_metrics_invariants};

pub struct PipelineController {
    // Declared before `decoder`: the converter borrows decoder buffers and
    // must be torn down first.
    conversion: Conversion,
    decoder: DeviceSession,
    source: Box<dyn BitstreamSource>,
    converter_factory: SessionFactory,
    requested_size: Option<Rect>,
    requested_format: PixelFormat,
    wants_opaque: bool,
    capture_buffers: u32,
    draining: bool,
    finished: bool,
    shut_down: bool,
    strict_invariants: bool,
    pending: Option<BitstreamPacket>,
    next_sequence: u64,
    return_tx: Sender<ReturnedBuffer>,
    return_rx: Receiver<ReturnedBuffer>,
    metrics: Arc<DecodeMetrics>,
}

impl PipelineController {
    /// Open the decoder, configure its bitstream queue and subscribe to
    /// source-change events.
    ///
    /// A device without source-change events is only usable when the
    /// config supplies the coded size.
    pub fn new(
        config: &DecoderConfig,
        mut decoder: DeviceSession,
        source: Box<dyn BitstreamSource>,
        converter_factory: SessionFactory,
    ) -> Result<Self> {
        config.validate()?;
        decoder.device_mut().open()?;

        let coded = config.coded_size.unwrap_or_default();
        decoder.configure_output(
            coded,
            config.codec.fourcc(),
            MemoryModel::Mmap,
            config.num_output_buffers,
            None,
        )?;

        match decoder.device_mut().subscribe_source_change() {
            Ok(()) => debug!("Subscribed to source-change events"),
            Err(err) if config.coded_size.is_none() => {
                return Err(EngineError::UnsupportedEvent(format!(
                    "{err}; a coded size must be configured for this device"
                )));
            }
            Err(err) => warn!(
                error = %err,
                coded = %coded,
                "Source-change events unavailable; resolution changes will not be followed"
            ),
        }

        let (return_tx, return_rx) = mpsc::channel();
        let wants_opaque = config.opaque_output || config.output_format == PixelFormat::DrmPrime;

        info!(
            codec = config.codec.name(),
            coded = %coded,
            output_format = %config.output_format,
            opaque = wants_opaque,
            capture_buffers = config.num_capture_buffers,
            "Decoder session created"
        );

        Ok(Self {
            conversion: Conversion::Direct,
            decoder,
            source,
            converter_factory,
            requested_size: config.coded_size,
            requested_format: config.output_format,
            wants_opaque,
            capture_buffers: config.num_capture_buffers,
            draining: false,
            finished: false,
            shut_down: false,
            strict_invariants: false,
            pending: None,
            next_sequence: 0,
            return_tx,
            return_rx,
            metrics: DecodeMetrics::new(),
        })
    }

    /// Promote metrics invariant violations into a hard error at shutdown.
    pub fn with_strict_invariants(mut self, strict: bool) -> Self {
        self.strict_invariants = strict;
        self
    }

    pub fn uses_conversion(&self) -> bool {
        self.conversion.is_active()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn wants_opaque_output(&self) -> bool {
        self.wants_opaque
    }

    pub fn metrics(&self) -> Arc<DecodeMetrics> {
        self.metrics.clone()
    }

    pub fn decoder(&self) -> &DeviceSession {
        &self.decoder
    }

    pub fn converter(&self) -> Option<&DeviceSession> {
        self.conversion.stage().map(ConversionStage::session)
    }

    /// `(output, capture)` states of the decoder queues.
    pub fn decoder_states(&self) -> (QueueState, QueueState) {
        (
            self.decoder.state(Direction::Output),
            self.decoder.state(Direction::Capture),
        )
    }

    // ─── Start / reconfigure ────────────────────────────────────────────

    /// Bring every queue as far towards streaming as current knowledge allows.
    ///
    /// Cheap and side-effect free once the decoder capture streams.
    pub fn try_start(&mut self) -> Result<()> {
        self.decoder.start(Direction::Output)?;
        if self.decoder.state(Direction::Capture).is_streaming() {
            return Ok(());
        }

        debug!("Configuring decoder capture");
        let native = self.decoder.query_capture()?;
        self.decoder
            .init_capture(MemoryModel::Mmap, self.capture_buffers, None)?;

        if needs_conversion(native, self.requested_format) {
            self.start_conversion(native)?;
        } else {
            let requested = self.requested_size.unwrap_or(self.decoder.coded_size());
            self.decoder.negotiate_crop(requested);
        }

        self.decoder.start(Direction::Capture)?;
        info!(
            format = %self.decoder.pixel_format(),
            coded = %self.decoder.coded_size(),
            visible = %self.decoder.visible_size(),
            converting = self.uses_conversion(),
            "Decoder capture streaming"
        );
        Ok(())
    }

    fn start_conversion(&mut self, native: PixelFormat) -> Result<()> {
        if let Conversion::Direct = self.conversion {
            warn!(
                native = %native,
                requested = %self.requested_format,
                "Decoder output needs conversion"
            );
            let session = (self.converter_factory)().map_err(|err| EngineError::ConverterConfig {
                step: "create",
                reason: err.to_string(),
            })?;
            self.conversion = Conversion::Converting(Box::new(ConversionStage::new(session)));
            self.wants_opaque = false;
        }
        let Conversion::Converting(stage) = &mut self.conversion else {
            return Err(EngineError::InvariantViolation(
                "conversion stage missing after creation".into(),
            ));
        };

        if stage.is_live() {
            warn!(
                native = %native,
                "Converter already streaming; keeping its current configuration"
            );
            return Ok(());
        }

        let requested = self.requested_size.unwrap_or(self.decoder.coded_size());
        stage.bring_up(
            &self.decoder,
            requested,
            self.requested_format,
            self.capture_buffers,
        )?;
        DecodeMetrics::bump(&self.metrics.converter_bringups);
        Ok(())
    }

    /// Run [`try_start`](Self::try_start); `Ok(false)` when the attempt
    /// failed transiently and should be retried on a later call.
    fn attempt_start(&mut self) -> Result<bool> {
        match self.try_start() {
            Ok(()) => Ok(true),
            Err(err) if err.is_transient() => {
                warn!(error = %err, code = err.error_code(), "Start attempt failed; will retry");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Renegotiate the decoder capture after the device reported new
    /// stream parameters.
    ///
    /// The configured coded size no longer describes the stream: later crops
    /// use the size the decoder reports.
    pub fn handle_source_change(&mut self) -> Result<()> {
        info!(
            previous = %self.decoder.coded_size(),
            "Source change; renegotiating decoder capture"
        );
        self.requested_size = None;
        self.decoder.release_capture()?;
        DecodeMetrics::bump(&self.metrics.capture_reconfigurations);
        self.attempt_start()?;
        Ok(())
    }

    fn poll_events(&mut self) -> Result<()> {
        loop {
            let event = match self.decoder.device_mut().dequeue_event() {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(()),
                Err(err) => {
                    warn!(error = %err, "Event dequeue failed");
                    return Ok(());
                }
            };
            match event {
                DeviceEvent::SourceChange { changes } => {
                    if changes & V4L2_EVENT_SRC_CH_RESOLUTION != 0 {
                        self.handle_source_change()?;
                    } else {
                        debug!(changes, "Ignoring source change without resolution change");
                    }
                }
                DeviceEvent::EndOfStream => debug!("Device end-of-stream event"),
                DeviceEvent::Other(kind) => debug!(kind, "Ignoring device event"),
            }
        }
    }

    // ─── Input ──────────────────────────────────────────────────────────

    fn begin_drain(&mut self) {
        self.draining = true;
        info!(
            submitted = self.metrics.packets_submitted.load(Ordering::Relaxed),
            "Upstream finished; draining decoder"
        );
        if !self.decoder.state(Direction::Output).is_streaming() {
            return;
        }
        if let Err(err) = self.decoder.device_mut().stop_decoder() {
            warn!(error = %err, "Decoder stop command failed");
        }
    }

    /// Enqueue one access unit.  Returns `false` when the start attempt that
    /// follows it failed and the call should end with a retry.
    fn submit(&mut self, packet: BitstreamPacket) -> Result<bool> {
        if packet.is_empty() {
            debug!(pts = packet.pts, "Skipping empty access unit");
            return Ok(true);
        }

        let enqueued = self
            .decoder
            .output_mut()
            .enqueue(QueueBuffer::Bitstream(&packet));
        match enqueued {
            Ok(()) => DecodeMetrics::bump(&self.metrics.packets_submitted),
            Err(EngineError::OutOfInputBuffers) => {
                debug!(pts = packet.pts, "Bitstream queue full; keeping packet");
                DecodeMetrics::bump(&self.metrics.input_backpressure);
                self.pending = Some(packet);
            }
            Err(err) => return Err(err),
        }

        self.attempt_start()
    }

    // ─── Output ─────────────────────────────────────────────────────────

    fn effective_output_streaming(&self) -> bool {
        match &self.conversion {
            Conversion::Converting(stage) => stage.is_live(),
            Conversion::Direct => self.decoder.state(Direction::Capture).is_streaming(),
        }
    }

    /// Re-enqueue capture buffers whose frames have been dropped.
    ///
    /// Buffers from a pool that was released in the meantime are discarded.
    pub fn reclaim_returned_buffers(&mut self) -> Result<()> {
        while let Ok(returned) = self.return_rx.try_recv() {
            let session = match (returned.origin, &mut self.conversion) {
                (BufferOrigin::Decoder, _) => &mut self.decoder,
                (BufferOrigin::Converter, Conversion::Converting(stage)) => stage.session_mut(),
                (BufferOrigin::Converter, Conversion::Direct) => continue,
            };
            if returned.generation != session.capture_generation()
                || !session.state(Direction::Capture).is_streaming()
            {
                debug!(
                    index = returned.index,
                    generation = returned.generation,
                    "Discarding stale buffer return"
                );
                continue;
            }
            session
                .capture_mut()
                .enqueue(QueueBuffer::Recycle(returned.index))?;
        }
        Ok(())
    }

    fn dequeue(&mut self) -> Result<ReceiveOutcome> {
        // Bitstream already sits in the device but the last start attempt
        // failed: try again instead of waiting for another packet.
        if !self.decoder.state(Direction::Capture).is_streaming()
            && self.decoder.state(Direction::Output).is_streaming()
            && !self.attempt_start()?
        {
            return Ok(self.retry());
        }
        if !self.effective_output_streaming() {
            if self.draining {
                return Ok(self.finish());
            }
            return Ok(self.retry());
        }

        let (dequeued, origin) = match &mut self.conversion {
            Conversion::Converting(stage) => {
                (stage.relay(&mut self.decoder)?, BufferOrigin::Converter)
            }
            Conversion::Direct => (
                self.decoder.capture_mut().dequeue(Wait::Block)?,
                BufferOrigin::Decoder,
            ),
        };

        match dequeued {
            Dequeued::Buffer(buffer) => self.deliver(buffer, origin).map(ReceiveOutcome::Frame),
            Dequeued::Retry => Ok(self.retry()),
            Dequeued::EndOfStream => Ok(self.finish()),
        }
    }

    fn retry(&self) -> ReceiveOutcome {
        DecodeMetrics::bump(&self.metrics.retries);
        ReceiveOutcome::Retry
    }

    fn finish(&mut self) -> ReceiveOutcome {
        if !self.finished {
            self.finished = true;
            info!(delivered = self.next_sequence, "Decoder drained");
        }
        ReceiveOutcome::EndOfStream
    }

    fn origin_session(&mut self, origin: BufferOrigin) -> Result<&mut DeviceSession> {
        match (origin, &mut self.conversion) {
            (BufferOrigin::Decoder, _) => Ok(&mut self.decoder),
            (BufferOrigin::Converter, Conversion::Converting(stage)) => Ok(stage.session_mut()),
            (BufferOrigin::Converter, Conversion::Direct) => Err(EngineError::InvariantViolation(
                "converted frame without a conversion stage".into(),
            )),
        }
    }

    /// Turn a dequeued capture buffer into a complete frame, or hand the
    /// buffer back and fail.
    fn deliver(&mut self, buffer: DequeuedBuffer, origin: BufferOrigin) -> Result<Frame> {
        let opaque = self.wants_opaque;
        let session = self.origin_session(origin)?;
        let layer_format = session
            .capture_format()
            .map(|format| format.fourcc)
            .unwrap_or_default();

        let payload = if opaque {
            drm_payload(&buffer, layer_format)
        } else {
            plane_payload(&buffer)
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                session
                    .capture_mut()
                    .enqueue(QueueBuffer::Recycle(buffer.index))?;
                return Err(err);
            }
        };

        let format = if opaque {
            PixelFormat::DrmPrime
        } else {
            session.pixel_format()
        };
        let visible = session.visible_size();
        let coded = session.coded_size();
        let returned = ReturnedBuffer {
            origin,
            index: buffer.index,
            generation: session.capture_generation(),
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        DecodeMetrics::bump(&self.metrics.frames_delivered);

        Ok(Frame {
            format,
            visible,
            coded,
            pts: buffer.timestamp,
            sequence,
            payload,
            lease: BufferLease::new(returned, self.return_tx.clone()),
        })
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    /// Stop the converter, then the decoder, and check the session counters.
    ///
    /// Idempotent.  Also run on drop, where errors are only logged.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.finished = true;

        if let Conversion::Converting(stage) = &mut self.conversion {
            stage.shutdown();
        }
        for direction in [Direction::Capture, Direction::Output] {
            if let Err(err) = self.decoder.stop(direction) {
                warn!(queue = direction.label(), error = %err, "Decoder stream-off failed");
            }
        }

        self.metrics.report();
        enforce_metrics_invariants(&self.metrics, self.strict_invariants)
    }
}

fn plane_payload(buffer: &DequeuedBuffer) -> Result<FramePayload> {
    buffer
        .planes
        .iter()
        .enumerate()
        .map(|(i, plane)| {
            let data = plane.data.clone().ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "capture buffer {} plane {i} is not mapped",
                    buffer.index
                ))
            })?;
            Ok(FramePlane {
                data,
                pitch: plane.pitch,
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(FramePayload::Planes)
}

fn drm_payload(
    buffer: &DequeuedBuffer,
    layer_format: FourCC,
) -> Result<FramePayload> {
    let mut objects = Vec::with_capacity(buffer.planes.len());
    let mut planes = Vec::with_capacity(buffer.planes.len());
    for (i, plane) in buffer.planes.iter().enumerate() {
        let fd = plane.fd.ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "capture buffer {} plane {i} has no exported dmabuf",
                buffer.index
            ))
        })?;
        objects.push(DrmObject {
            fd,
            size: plane.bytes_used,
        });
        planes.push(DrmPlane {
            object_index: i,
            offset: plane.offset,
            pitch: plane.pitch,
        });
    }
    Ok(FramePayload::DrmPrime(DrmDescriptor {
        objects,
        layer_format,
        planes,
    }))
}

impl FrameDecoder for PipelineController {
    fn receive_frame(&mut self) -> Result<ReceiveOutcome> {
        if self.finished {
            return Ok(ReceiveOutcome::EndOfStream);
        }
        self.reclaim_returned_buffers()?;
        self.poll_events()?;

        if !self.draining {
            let packet = match self.pending.take() {
                Some(packet) => Some(packet),
                None => self.source.read_packet()?,
            };
            match packet {
                None => self.begin_drain(),
                Some(packet) => {
                    if !self.submit(packet)? {
                        return Ok(self.retry());
                    }
                }
            }
        }

        self.dequeue()
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "Decoder shutdown reported an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use m2m_v4l2::queue::BufferPlane;

    fn buffer(planes: Vec<BufferPlane>) -> DequeuedBuffer {
        DequeuedBuffer {
            index: 3,
            timestamp: 0,
            planes,
        }
    }

    #[test]
    fn unmapped_plane_is_never_delivered_as_partial_frame() {
        let err = plane_payload(&buffer(vec![BufferPlane {
            fd: Some(9),
            ..Default::default()
        }]))
        .expect_err("missing data");
        assert!(err.to_string().contains("not mapped"));
    }

    #[test]
    fn drm_payload_maps_one_object_per_plane() {
        let payload = drm_payload(
            &buffer(vec![
                BufferPlane {
                    fd: Some(40),
                    pitch: 1920,
                    bytes_used: 1920 * 1088,
                    ..Default::default()
                },
                BufferPlane {
                    fd: Some(41),
                    pitch: 1920,
                    bytes_used: 1920 * 544,
                    data: Some(Bytes::from_static(b"uv")),
                    ..Default::default()
                },
            ]),
            FourCC::new(b"NM12"),
        )
        .expect("descriptor");
        let FramePayload::DrmPrime(desc) = payload else {
            panic!("expected a DRM descriptor");
        };
        assert_eq!(desc.objects.len(), 2);
        assert_eq!(desc.objects[1].fd, 41);
        assert_eq!(desc.planes[1].object_index, 1);
    }
}
