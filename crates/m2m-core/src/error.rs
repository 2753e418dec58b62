//! Typed error hierarchy for the decode pipeline.
//!
//! Uses `thiserror` for library-grade errors.  Binaries map these onto exit
//! codes through [`EngineError::error_code`].
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code for structured reporting
//! without string parsing.

use std::io;
use std::path::PathBuf;

/// All errors originating from the decode pipeline.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Device ───────────────────────────────────────────────────────
    #[error("{ioctl} failed: {source}")]
    DeviceQuery {
        ioctl: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open device {}: {source}", path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Device {0} is not a V4L2 mem2mem device")]
    NotM2mDevice(String),

    // ── Queues ───────────────────────────────────────────────────────
    #[error("No free input buffer on the bitstream queue")]
    OutOfInputBuffers,

    #[error("Buffer allocation failed: {0}")]
    Allocation(String),

    #[error("Queue error: {0}")]
    Queue(String),

    // ── Pipeline ─────────────────────────────────────────────────────
    #[error("Converter configuration failed at {step}: {reason}")]
    ConverterConfig { step: &'static str, reason: String },

    #[error("Source change events unsupported: {0}")]
    UnsupportedEvent(String),

    #[error("Bitstream source error: {0}")]
    Source(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Shorthand for wrapping an errno-style failure of a named ioctl.
    pub fn ioctl(ioctl: &'static str, source: impl Into<io::Error>) -> Self {
        Self::DeviceQuery {
            ioctl,
            source: source.into(),
        }
    }

    /// Stable integer error code for structured reporting.
    ///
    /// Codes are grouped by category:
    /// - 1xx: device
    /// - 2xx: queues
    /// - 3xx: pipeline
    /// - 4xx: configuration
    pub fn error_code(&self) -> u32 {
        match self {
            Self::DeviceQuery { .. } => 100,
            Self::DeviceOpen { .. } => 101,
            Self::NotM2mDevice(_) => 102,
            Self::OutOfInputBuffers => 200,
            Self::Allocation(_) => 201,
            Self::Queue(_) => 202,
            Self::ConverterConfig { .. } => 300,
            Self::UnsupportedEvent(_) => 301,
            Self::Source(_) => 302,
            Self::InvariantViolation(_) => 303,
            Self::Config(_) => 400,
        }
    }

    /// Whether a later call may succeed without any caller intervention.
    ///
    /// Transient errors are absorbed by the pipeline controller and surface
    /// to callers only as a retry signal.  Allocation failures, broken queue
    /// state and configuration mistakes never heal on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::OutOfInputBuffers
                | Self::DeviceQuery { .. }
                | Self::Queue(_)
                | Self::ConverterConfig { .. }
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn allocation_failures_are_not_transient() {
        assert!(!EngineError::Allocation("capture pool".into()).is_transient());
        assert!(!EngineError::InvariantViolation("bad transition".into()).is_transient());
        assert!(!EngineError::Config("num_capture_buffers".into()).is_transient());
        assert!(EngineError::OutOfInputBuffers.is_transient());
        assert!(EngineError::Queue("STREAMON refused".into()).is_transient());
        assert!(
            EngineError::ConverterConfig {
                step: "open",
                reason: "busy".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn ioctl_helper_keeps_ioctl_name_in_message() {
        let err = EngineError::ioctl(
            "VIDIOC_G_FMT",
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        );
        assert_eq!(err.error_code(), 100);
        assert!(err.to_string().starts_with("VIDIOC_G_FMT failed"));
    }
}
