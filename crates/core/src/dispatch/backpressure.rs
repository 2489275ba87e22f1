//! Execution slots and the watermark gate in front of them
//!
//! A worker runs at most `max_concurrency` executions, one per semaphore
//! permit. The gate reads the same permits: once in-flight executions reach
//! the high watermark the poll loop stops fetching, and it resumes only after
//! they drain to the low watermark.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Watermarks for the polling gate
///
/// Both are fractions of `max_concurrency`.
///
/// # Example
///
/// ```
/// use taskflow_core::dispatch::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_high_watermark(0.85)
///     .with_low_watermark(0.65);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Fraction of slots in use at which polling pauses
    pub high_watermark: f64,

    /// Fraction of slots in use at or below which polling resumes
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 1.0,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    /// Default watermarks: pause when full, resume at 70%
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pause threshold, clamped to `0.0..=1.0`
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Set the resume threshold, clamped to `0.0..=1.0`
    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Both watermarks within `0.0..=1.0` and `low < high`
    pub fn validate(&self) -> Result<(), BackpressureError> {
        let in_range = |w: f64| (0.0..=1.0).contains(&w);
        if !in_range(self.high_watermark) || !in_range(self.low_watermark) {
            return Err(BackpressureError::InvalidConfig(format!(
                "watermarks must be within 0.0..=1.0, got high={} low={}",
                self.high_watermark, self.low_watermark
            )));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(format!(
                "low_watermark ({}) must be below high_watermark ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// One claimed execution slot; dropping it frees the slot
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

/// Bounded execution slots with a hysteresis gate for polling
///
/// Watermarks are converted to whole slot counts up front: polling pauses at
/// `ceil(high * capacity)` in-flight executions and resumes at
/// `floor(low * capacity)`.
#[derive(Debug)]
pub struct ExecutionSlots {
    permits: Arc<Semaphore>,
    capacity: usize,
    pause_at: usize,
    resume_at: usize,
    paused: AtomicBool,
}

impl ExecutionSlots {
    /// `capacity` slots gated by `config`
    pub fn new(capacity: usize, config: &BackpressureConfig) -> Self {
        let capacity = capacity.max(1);
        let pause_at = ((capacity as f64 * config.high_watermark).ceil() as usize).clamp(1, capacity);
        let resume_at = ((capacity as f64 * config.low_watermark).floor() as usize).min(pause_at - 1);

        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            pause_at,
            resume_at,
            paused: AtomicBool::new(false),
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Executions currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Whether the poll loop may fetch more work
    ///
    /// Flips to paused at the high watermark and stays there until the low
    /// watermark is reached.
    pub fn admit(&self) -> bool {
        let in_flight = self.in_flight();
        if self.paused.load(Ordering::Acquire) {
            if in_flight <= self.resume_at {
                self.paused.store(false, Ordering::Release);
                return true;
            }
            false
        } else if in_flight >= self.pause_at {
            self.paused.store(true, Ordering::Release);
            false
        } else {
            true
        }
    }

    /// Whether the gate is currently paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Claim a free slot without waiting
    pub fn try_claim(&self) -> Option<Slot> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    /// Wait until every slot is free
    pub async fn drained(&self) {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        // Holding every permit at once means no execution holds one
        if let Ok(permits) = self.permits.acquire_many(all).await {
            drop(permits);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn slots(capacity: usize, high: f64, low: f64) -> ExecutionSlots {
        let config = BackpressureConfig::new()
            .with_high_watermark(high)
            .with_low_watermark(low);
        ExecutionSlots::new(capacity, &config)
    }

    #[test]
    fn test_config_validation() {
        assert!(BackpressureConfig::default().validate().is_ok());

        let inverted = BackpressureConfig::new()
            .with_high_watermark(0.5)
            .with_low_watermark(0.8);
        assert!(inverted.validate().is_err());

        let out_of_range = BackpressureConfig {
            high_watermark: 1.5,
            low_watermark: 0.2,
        };
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn test_claims_are_bounded_by_capacity() {
        let slots = slots(2, 1.0, 0.5);
        let a = slots.try_claim().unwrap();
        let _b = slots.try_claim().unwrap();

        assert!(slots.try_claim().is_none());
        assert_eq!(slots.in_flight(), 2);
        assert_eq!(slots.available(), 0);

        drop(a);
        assert_eq!(slots.in_flight(), 1);
        assert!(slots.try_claim().is_some());
    }

    #[test]
    fn test_gate_follows_real_slot_usage() {
        let slots = slots(10, 0.8, 0.5);
        assert!(slots.admit());

        let mut held: Vec<Slot> = (0..8).map(|_| slots.try_claim().unwrap()).collect();
        assert!(!slots.admit());
        assert!(slots.is_paused());

        // 7 and 6 in flight: still above the low watermark
        held.pop();
        assert!(!slots.admit());
        held.pop();
        assert!(!slots.admit());

        held.pop();
        assert!(slots.admit());
        assert!(!slots.is_paused());
    }

    #[test]
    fn test_fractional_watermarks_round_to_slots() {
        // pause at ceil(8.5) = 9, resume at floor(6.5) = 6
        let slots = slots(10, 0.85, 0.65);
        let mut held: Vec<Slot> = (0..8).map(|_| slots.try_claim().unwrap()).collect();
        assert!(slots.admit());

        held.push(slots.try_claim().unwrap());
        assert!(!slots.admit());

        held.truncate(7);
        assert!(!slots.admit());
        held.truncate(6);
        assert!(slots.admit());
    }

    #[test]
    fn test_single_slot_pool() {
        let slots = slots(1, 1.0, 0.7);
        let slot = slots.try_claim().unwrap();
        assert!(!slots.admit());
        drop(slot);
        assert!(slots.admit());
    }

    #[tokio::test]
    async fn test_drained_waits_for_release() {
        let slots = Arc::new(slots(2, 1.0, 0.5));
        let slot = slots.try_claim().unwrap();

        let waiter = {
            let slots = slots.clone();
            tokio::spawn(async move { slots.drained().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(slot);
        waiter.await.unwrap();
        assert_eq!(slots.in_flight(), 0);
    }
}
