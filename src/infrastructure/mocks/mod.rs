//! Mock implementations for testing.
//!
//! Test doubles for the tracing side of the crate. Deterministic time is
//! provided by [`ManualClock`](crate::ManualClock), which is always available.

pub mod layer;

pub use layer::{CapturedEvent, MockCaptureLayer};
