//! # TaskFlow Coordination Core
//!
//! Distributed job coordination for a fleet of stateless workers competing
//! for work, with at-least-once execution and bounded, deterministic retries.
//!
//! ## Features
//!
//! - **Job state machine**: legal transitions only, applied with compare-and-set
//! - **Lease-based exclusion**: TTL leases with per-attempt owner tokens
//! - **Polling dispatcher**: bounded batches, backpressure, adaptive idle wait
//! - **Crash recovery**: expired leases on `RUNNING` jobs are reclaimed
//! - **Deterministic backoff**: exponential, capped, no jitter
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (polls eligible jobs, gates them through leases, reclaims) │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌────────────────────┐
//! │    JobStore     │ │ LeaseCoordinator │ │  ExecutionWrapper  │
//! │  (PostgreSQL,   │ │  (Redis, TTL,    │ │  (handler, renew,  │
//! │  source of      │ │  advisory only)  │ │  state machine,    │
//! │  truth)         │ │                  │ │  backoff, commit)  │
//! └─────────────────┘ └──────────────────┘ └────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskflow_core::prelude::*;
//!
//! let store = Arc::new(PostgresJobStore::connect(&database_url, 10).await?);
//! let leases = Arc::new(RedisLeaseCoordinator::connect(&redis_url).await?);
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("email", |ctx, payload| async move {
//!     send_email(payload).await?;
//!     Ok(())
//! })?;
//!
//! let dispatcher = Dispatcher::new(store, leases, Arc::new(registry), TaskFlowConfig::from_env()?)?;
//! dispatcher.start()?;
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod execution;
pub mod job;
pub mod lease;
pub mod persistence;
pub mod reliability;

/// Prelude for common imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use async_trait::async_trait;
    pub use serde_json::Value;

    pub use crate::client::{JobClient, OperationalSnapshot};
    pub use crate::config::TaskFlowConfig;
    pub use crate::dispatch::{DispatchReport, Dispatcher, DispatcherStatus};
    pub use crate::error::TaskFlowError;
    pub use crate::execution::{
        ExecutionFailure, ExecutionReport, HandlerRegistry, JobContext, JobHandler,
        TypedJobHandler,
    };
    pub use crate::job::{Job, JobId, JobStatus, NewJob};
    pub use crate::lease::{InMemoryLeaseCoordinator, LeaseCoordinator, OwnerToken};
    #[cfg(feature = "redis")]
    pub use crate::lease::RedisLeaseCoordinator;
    pub use crate::persistence::{InMemoryJobStore, JobStore, PostgresJobStore, StoreError};
    pub use crate::reliability::BackoffPolicy;
}

// Re-export key types at crate root
pub use client::{JobClient, OperationalSnapshot};
pub use config::{ConfigError, TaskFlowConfig};
pub use dispatch::{DispatchReport, Dispatcher, DispatcherError, DispatcherStatus};
pub use error::TaskFlowError;
pub use execution::{
    DiscardReason, ExecutionFailure, ExecutionReport, ExecutionWrapper, HandlerRegistry,
    JobContext, JobHandler, RegistryError, TypedJobHandler,
};
pub use job::{FieldUpdates, IllegalTransition, Job, JobEvent, JobId, JobStatus, NewJob, Transition};
#[cfg(feature = "redis")]
pub use lease::RedisLeaseCoordinator;
pub use lease::{InMemoryLeaseCoordinator, LeaseCoordinator, LeaseError, LeaseGrant, LeaseStats, OwnerToken};
pub use persistence::{InMemoryJobStore, JobCounts, JobStore, PostgresJobStore, StoreError};
pub use reliability::BackoffPolicy;
