//! Mock implementations for testing.
//!
//! This module provides test doubles for infrastructure adapters,
//! enabling controlled testing of application logic.

pub mod clock;
pub mod event_log;
pub mod layer;

pub use clock::MockClock;
pub use event_log::FlakyEventLog;
pub use layer::{CapturedEvent, MockCaptureLayer};
