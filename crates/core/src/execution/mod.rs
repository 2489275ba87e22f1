//! Job execution
//!
//! This module provides:
//! - [`JobHandler`] / [`TypedJobHandler`] - the work unit behind a job kind
//! - [`HandlerRegistry`] - kind to handler mapping
//! - [`ExecutionWrapper`] - runs an attempt and records its outcome

mod executor;
mod handler;

pub use executor::{DiscardReason, ExecutionReport, ExecutionWrapper};
pub use handler::{
    ExecutionFailure, HandlerRegistry, JobContext, JobHandler, RegistryError, TypedJobHandler,
};
