//! Persistence layer for job records
//!
//! This module provides:
//! - [`JobStore`] trait, the durable source of truth for job status
//! - [`InMemoryJobStore`] for testing and single-process use
//! - [`PostgresJobStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use store::{JobCounts, JobStore, StoreError, DEFAULT_MAX_PAYLOAD_BYTES};
