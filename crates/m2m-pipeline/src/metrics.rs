//! Decode session counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, warn};

use m2m_core::error::{EngineError, Result};

/// Per-session counters, shareable with a reporting thread.
#[derive(Debug, Default)]
pub struct DecodeMetrics {
    /// Access units accepted by the decoder's bitstream queue.
    pub packets_submitted: AtomicU64,
    /// Frames handed to the caller.
    pub frames_delivered: AtomicU64,
    /// Pull attempts that ended in a retry signal.
    pub retries: AtomicU64,
    /// Times the bitstream queue was full.
    pub input_backpressure: AtomicU64,
    /// Successful converter bring-ups.  At most one per session.
    pub converter_bringups: AtomicU64,
    /// Decoder capture renegotiations after a source change.
    pub capture_reconfigurations: AtomicU64,
}

impl DecodeMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames never outnumber the access units they were decoded from.
    pub fn validate(&self) -> bool {
        let (submitted, delivered) = self.delivery_counts();
        delivered <= submitted
    }

    fn delivery_counts(&self) -> (u64, u64) {
        (
            self.packets_submitted.load(Ordering::Acquire),
            self.frames_delivered.load(Ordering::Acquire),
        )
    }

    pub fn report(&self) {
        info!(
            submitted = self.packets_submitted.load(Ordering::Relaxed),
            delivered = self.frames_delivered.load(Ordering::Relaxed),
            retries = self.retries.load(Ordering::Relaxed),
            backpressure = self.input_backpressure.load(Ordering::Relaxed),
            converter_bringups = self.converter_bringups.load(Ordering::Relaxed),
            reconfigurations = self.capture_reconfigurations.load(Ordering::Relaxed),
            "Decode session counters"
        );
    }
}

/// Check counter invariants at shutdown.  Violations fail only in strict mode.
pub fn enforce_metrics_invariants(metrics: &DecodeMetrics, strict: bool) -> Result<()> {
    if metrics.validate() {
        return Ok(());
    }
    let (submitted, delivered) = metrics.delivery_counts();
    if !strict {
        warn!(submitted, delivered, "Delivered more frames than packets submitted");
        return Ok(());
    }
    Err(EngineError::InvariantViolation(format!(
        "Decode delivery violation: submitted={submitted} delivered={delivered}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_invariants_fail_when_frames_exceed_packets() {
        let metrics = DecodeMetrics::new();
        metrics.packets_submitted.store(3, Ordering::Release);
        metrics.frames_delivered.store(4, Ordering::Release);

        let err = enforce_metrics_invariants(&metrics, true).expect_err("expected strict failure");
        match err {
            EngineError::InvariantViolation(msg) => {
                assert!(msg.contains("submitted=3"));
                assert!(msg.contains("delivered=4"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn default_invariants_only_warn() {
        let metrics = DecodeMetrics::new();
        metrics.frames_delivered.store(1, Ordering::Release);
        enforce_metrics_invariants(&metrics, false)
            .expect("default mode should not hard-fail invariant violations");
    }
}
