//! Decoder session configuration.
//!
//! Loaded from JSON (see [`DecoderConfig::from_json_str`]) or built in code.
//! The schema version is checked before deserialization so that stale
//! files fail with a clear message instead of a field error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::{PixelFormat, Rect, VideoCodec};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Smallest capture pool the decoder accepts.
pub const MIN_CAPTURE_BUFFERS: u32 = 8;
/// Smallest bitstream pool the decoder accepts.
pub const MIN_OUTPUT_BUFFERS: u32 = 6;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_schema_version")]
    pub config_schema_version: u32,
    pub codec: VideoCodec,
    /// Initial coded size.  When absent the device must report it through a
    /// source-change event.
    #[serde(default)]
    pub coded_size: Option<Rect>,
    /// Layout the consumer wants.  A mismatch with the decoder's native
    /// capture format splices in the converter.
    #[serde(default)]
    pub output_format: PixelFormat,
    /// Deliver frames as DRM-PRIME descriptors instead of plane bytes.
    #[serde(default)]
    pub opaque_output: bool,
    #[serde(default = "default_capture_buffers")]
    pub num_capture_buffers: u32,
    #[serde(default = "default_output_buffers")]
    pub num_output_buffers: u32,
    #[serde(default)]
    pub decoder_device: Option<PathBuf>,
    #[serde(default)]
    pub converter_device: Option<PathBuf>,
}

fn default_schema_version() -> u32 {
    CONFIG_SCHEMA_VERSION
}

fn default_capture_buffers() -> u32 {
    16
}

fn default_output_buffers() -> u32 {
    16
}

impl DecoderConfig {
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            config_schema_version: CONFIG_SCHEMA_VERSION,
            codec,
            coded_size: None,
            output_format: PixelFormat::default(),
            opaque_output: false,
            num_capture_buffers: default_capture_buffers(),
            num_output_buffers: default_output_buffers(),
            decoder_device: None,
            converter_device: None,
        }
    }

    pub fn with_coded_size(mut self, size: Rect) -> Self {
        self.coded_size = Some(size);
        self
    }

    pub fn with_output_format(mut self, format: PixelFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|err| EngineError::Config(format!("Invalid decoder config JSON: {err}")))?;

        if let Some(version) = value.get("config_schema_version") {
            let Some(version) = version.as_u64() else {
                return Err(EngineError::Config(format!(
                    "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got non-integer"
                )));
            };
            if version != u64::from(CONFIG_SCHEMA_VERSION) {
                return Err(EngineError::Config(format!(
                    "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got {version}"
                )));
            }
        }

        serde_json::from_value(value)
            .map_err(|err| EngineError::Config(format!("Invalid decoder config JSON: {err}")))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!(
                "Failed to read decoder config from {}: {err}",
                path.display()
            ))
        })?;
        let config = Self::from_json_str(&data)?;
        tracing::debug!(path = %path.display(), codec = config.codec.name(), "Loaded decoder config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.config_schema_version != CONFIG_SCHEMA_VERSION {
            return Err(EngineError::Config(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got {}",
                self.config_schema_version
            )));
        }
        if self.num_capture_buffers < MIN_CAPTURE_BUFFERS {
            return Err(EngineError::Config(format!(
                "num_capture_buffers must be at least {MIN_CAPTURE_BUFFERS}, got {}",
                self.num_capture_buffers
            )));
        }
        if self.num_output_buffers < MIN_OUTPUT_BUFFERS {
            return Err(EngineError::Config(format!(
                "num_output_buffers must be at least {MIN_OUTPUT_BUFFERS}, got {}",
                self.num_output_buffers
            )));
        }
        if let Some(size) = self.coded_size
            && size.is_empty()
        {
            return Err(EngineError::Config(format!(
                "coded_size must be non-zero when given, got {size}"
            )));
        }
        if self.output_format == PixelFormat::None {
            return Err(EngineError::Config(
                "output_format must name a concrete layout".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let cfg = DecoderConfig::from_json_str(r#"{"codec":"h264"}"#).expect("parse");
        assert_eq!(cfg.codec, VideoCodec::H264);
        assert_eq!(cfg.num_capture_buffers, 16);
        assert_eq!(cfg.output_format, PixelFormat::Nv12);
        assert!(cfg.coded_size.is_none());
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn capture_pool_below_minimum_is_rejected() {
        let mut cfg = DecoderConfig::new(VideoCodec::Hevc);
        cfg.num_capture_buffers = 4;
        let err = cfg.validate().expect_err("must reject small pool");
        assert!(err.to_string().contains("num_capture_buffers"));
    }

    #[test]
    fn schema_mismatch_is_reported_before_field_errors() {
        let err = DecoderConfig::from_json_str(r#"{"config_schema_version":7,"codec":"nope"}"#)
            .expect_err("must fail");
        assert!(err.to_string().contains("expected 1, got 7"));
    }

    #[test]
    fn zero_coded_size_is_rejected() {
        let cfg = DecoderConfig::new(VideoCodec::Vp8).with_coded_size(Rect::new(0, 720));
        assert!(cfg.validate().is_err());
    }
}
