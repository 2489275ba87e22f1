//! Integration tests for RedisLeaseCoordinator
//!
//! Run with: cargo test -p taskflow-core --features redis --test redis_leases -- --ignored
//!
//! Requirements:
//! - Redis running with REDIS_URL set or redis://localhost:6379

#![cfg(feature = "redis")]

use std::time::Duration;

use taskflow_core::{JobId, LeaseCoordinator, OwnerToken, RedisLeaseCoordinator};

async fn create_test_coordinator() -> RedisLeaseCoordinator {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    RedisLeaseCoordinator::connect(&url)
        .await
        .expect("Failed to connect to Redis. Set REDIS_URL or ensure redis is running.")
        .with_key_prefix(format!("taskflow:test:{}:", JobId::new()))
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_single_winner_and_release() {
    let leases = create_test_coordinator().await;
    let id = JobId::new();
    let a = OwnerToken::generate("a");
    let b = OwnerToken::generate("b");
    let ttl = Duration::from_secs(30);

    assert!(leases.try_acquire(id, &a, ttl).await.unwrap());
    assert!(!leases.try_acquire(id, &b, ttl).await.unwrap());

    // Only the holder can renew or release
    assert!(!leases.renew(id, &b, ttl).await.unwrap());
    leases.release(id, &b).await.unwrap();
    assert!(leases.renew(id, &a, ttl).await.unwrap());

    leases.release(id, &a).await.unwrap();
    assert!(leases.try_acquire(id, &b, ttl).await.unwrap());
    leases.release(id, &b).await.unwrap();

    let stats = leases.stats();
    assert_eq!(stats.acquire_attempts, 3);
    assert_eq!(stats.acquire_conflicts, 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_lease_expires() {
    let leases = create_test_coordinator().await;
    let id = JobId::new();
    let a = OwnerToken::generate("a");

    assert!(leases.try_acquire(id, &a, Duration::from_millis(100)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(!leases.renew(id, &a, Duration::from_secs(30)).await.unwrap());
    let b = OwnerToken::generate("b");
    assert!(leases.try_acquire(id, &b, Duration::from_secs(1)).await.unwrap());
    leases.release(id, &b).await.unwrap();
}
