//! Reliability patterns for job execution
//!
//! This module provides:
//! - [`BackoffPolicy`] - Deterministic exponential backoff between attempts

mod backoff;

pub use backoff::BackoffPolicy;
