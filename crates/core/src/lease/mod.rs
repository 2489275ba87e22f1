//! Lease-based mutual exclusion
//!
//! This module provides:
//! - [`LeaseCoordinator`] trait, atomic acquire/renew/release keyed by job id
//! - [`OwnerToken`] - unique token per acquisition attempt
//! - [`InMemoryLeaseCoordinator`] for testing and single-process use
//! - [`RedisLeaseCoordinator`] for production (feature `redis`)

mod coordinator;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use coordinator::{
    LeaseCoordinator, LeaseCounters, LeaseError, LeaseGrant, LeaseStats, OwnerToken,
};
pub use memory::InMemoryLeaseCoordinator;
#[cfg(feature = "redis")]
pub use self::redis::{RedisLeaseCoordinator, DEFAULT_KEY_PREFIX};
