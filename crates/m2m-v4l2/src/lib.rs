#![doc = include_str!("../README.md")]

pub mod device;
pub mod queue;
pub mod session;
pub mod sys;

#[cfg(any(test, feature = "mock-device"))]
pub mod mock;
