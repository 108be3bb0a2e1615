//! Failure backoff policy for certificate records.
//!
//! Consecutive failures of a record multiply a base delay by two up to a
//! cap, with ±20% jitter so a fleet that failed together does not retry
//! against the ACME server in lockstep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Fraction of the delay used as the jitter window (±20%).
const JITTER_RATIO: f64 = 0.2;

/// Exponential backoff with jitter.
///
/// The policy itself is immutable; callers track the consecutive failure
/// count on their side and ask for the delay of the n-th failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on the delay regardless of failure count.
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Raw delay for the given consecutive failure count, before jitter.
    ///
    /// `failures` is the number of failures already observed, so the first
    /// failure (`failures == 1`) waits the base delay.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = failures.saturating_sub(1).min(63);
        let unclamped = self.base.as_secs_f64() * 2f64.powi(exp as i32);
        Duration::from_secs_f64(unclamped.min(self.cap.as_secs_f64()))
    }

    /// Delay for the given failure count with ±20% jitter applied.
    pub fn jittered_delay(&self, failures: u32) -> Duration {
        let raw = self.delay(failures);
        if raw.is_zero() {
            return raw;
        }
        let spread = raw.as_secs_f64() * JITTER_RATIO;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((raw.as_secs_f64() + jitter).max(0.0))
    }

    /// Absolute next-attempt deadline after a failure observed at `now`.
    pub fn next_attempt(&self, failures: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.jittered_delay(failures))
            .unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_failures_no_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.jittered_delay(0), Duration::ZERO);
    }

    #[test]
    fn test_doubling() {
        let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(3600));
        assert_eq!(policy.delay(1), Duration::from_secs(30));
        assert_eq!(policy.delay(2), Duration::from_secs(60));
        assert_eq!(policy.delay(3), Duration::from_secs(120));
        assert_eq!(policy.delay(5), Duration::from_secs(480));
    }

    #[test]
    fn test_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(3600));
        assert_eq!(policy.delay(10), Duration::from_secs(3600));
        // Far past the cap, and past any shift overflow territory.
        assert_eq!(policy.delay(200), Duration::from_secs(3600));
    }

    #[test]
    fn test_jitter_window() {
        let policy = BackoffPolicy::new(Duration::from_secs(100), Duration::from_secs(3600));
        for _ in 0..100 {
            let d = policy.jittered_delay(1).as_secs_f64();
            assert!((80.0..=120.0).contains(&d), "jittered delay {d} out of window");
        }
    }

    #[test]
    fn test_next_attempt_in_future() {
        let policy = BackoffPolicy::default();
        let now = Utc::now();
        let next = policy.next_attempt(3, now);
        assert!(next > now);
    }
}
