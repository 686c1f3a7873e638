//! Shared utilities for dce-sync integration tests

pub mod log_capture;

pub use log_capture::{capture_logs, LogCapture};
