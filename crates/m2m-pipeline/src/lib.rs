#![doc = include_str!("../README.md")]

pub mod controller;
pub mod conversion;
pub mod metrics;

pub use controller::PipelineController;
pub use conversion::{SessionFactory, needs_conversion};
pub use metrics::DecodeMetrics;
