//! Job domain model
//!
//! This module provides:
//! - [`Job`], [`JobId`], [`JobStatus`], [`NewJob`] - the durable job record
//! - [`JobEvent`] and [`Transition`] - the pure job state machine
//! - [`FieldUpdates`] - the field changes carried by a transition

mod record;
mod state;

pub use record::{Job, JobId, JobStatus, NewJob, ParseStatusError};
pub use state::{FieldUpdates, IllegalTransition, JobEvent, Transition};
