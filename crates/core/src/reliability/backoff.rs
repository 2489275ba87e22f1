//! Retry backoff policy

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// Deterministic exponential backoff
///
/// `delay_for_attempt(n) = min(base * multiplier^(n - 1), max)` for the n-th
/// recorded failure. There is no jitter: the same attempt always yields the
/// same delay, on every worker.
///
/// # Example
///
/// ```
/// use taskflow_core::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::exponential()
///     .with_base(Duration::from_secs(1))
///     .with_max(Duration::from_secs(60));
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    #[serde(with = "duration_millis")]
    pub base: Duration,

    /// Growth factor per additional failure
    pub multiplier: f64,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl BackoffPolicy {
    /// 1s base, doubling, capped at 5 minutes
    pub fn exponential() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(300),
        }
    }

    /// Same delay after every failure
    pub fn fixed(interval: Duration) -> Self {
        Self {
            base: interval,
            multiplier: 1.0,
            max: interval,
        }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Delay before the job becomes eligible again after its `attempt`-th
    /// recorded failure (1-based). Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max.as_secs_f64();

        if !raw.is_finite() || raw >= max {
            return self.max;
        }

        Duration::from_secs_f64(raw.max(0.0))
    }

    /// Check that the policy is monotonic and capped
    pub fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "backoff multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            ));
        }
        if self.base > self.max {
            return Err(format!(
                "backoff base ({:?}) must not exceed max ({:?})",
                self.base, self.max
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = BackoffPolicy::exponential();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = BackoffPolicy::exponential();

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn test_max_cap() {
        let policy = BackoffPolicy::exponential().with_max(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_monotonic_and_capped() {
        let policy = BackoffPolicy::exponential()
            .with_base(Duration::from_millis(150))
            .with_multiplier(1.7)
            .with_max(Duration::from_secs(30));

        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            assert!(delay <= policy.max);
            previous = delay;
        }
    }

    #[test]
    fn test_deterministic() {
        let policy = BackoffPolicy::exponential();
        for attempt in 0..20 {
            assert_eq!(policy.delay_for_attempt(attempt), policy.delay_for_attempt(attempt));
        }
    }

    #[test]
    fn test_fixed_interval() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_shrinking_policies() {
        assert!(BackoffPolicy::exponential().with_multiplier(0.5).validate().is_err());
        assert!(BackoffPolicy::exponential().with_multiplier(f64::NAN).validate().is_err());
        assert!(BackoffPolicy::exponential()
            .with_base(Duration::from_secs(10))
            .with_max(Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_serialization() {
        let policy = BackoffPolicy::exponential().with_max(Duration::from_secs(42));
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"max\":42000"));
        let parsed: BackoffPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
