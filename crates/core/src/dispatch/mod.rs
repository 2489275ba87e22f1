//! Dispatch: discovery, claiming and worker runtime
//!
//! This module provides:
//! - [`Dispatcher`] - poll loop, reclaim loop and execution slots
//! - [`JobPoller`] - candidate discovery with adaptive idle backoff
//! - [`ExecutionSlots`] - bounded execution slots behind a watermark gate

mod backpressure;
mod dispatcher;
mod poller;

pub use backpressure::{BackpressureConfig, BackpressureError, ExecutionSlots, Slot};
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherError, DispatcherStatus};
pub use poller::{JobPoller, PollerConfig};
