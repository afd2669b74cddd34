//! Reconnect backoff for relay connections.

use rand::Rng;
use std::time::Duration;

/// Extra delay added on top of the capped exponential delay, as a fraction
/// of that delay. Drawn from `[0, JITTER_FRACTION)`.
pub const JITTER_FRACTION: f64 = 0.3;

/// Exponential backoff: `min(base * 2^attempt, cap)` plus jitter.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    jitter: bool,
    attempt: u32,
}

impl ExponentialBackoff {
    /// `max_attempts` of 0 means unlimited attempts.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: (max_attempts != 0).then_some(max_attempts),
            jitter: true,
            attempt: 0,
        }
    }

    /// Disable jitter, making delays deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Capped exponential delay for `attempt`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(attempt.min(63)).unwrap_or(u128::MAX);
        let capped = base_ms.saturating_mul(multiplier).min(max_ms);
        Duration::from_millis(capped.min(u64::MAX as u128) as u64)
    }

    /// Next delay in the sequence, or `None` once the attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let delay = self.base_delay(self.attempt);
        let jitter = if self.jitter && !delay.is_zero() {
            delay.mul_f64(rand::rng().random_range(0.0..JITTER_FRACTION))
        } else {
            Duration::ZERO
        };

        self.attempt = self.attempt.saturating_add(1);
        Some(delay + jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_without_jitter() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1000), 3)
                .without_jitter();

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(), None);
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(1000);
        let mut backoff = ExponentialBackoff::new(base, cap, 0);

        for attempt in 0..12 {
            let floor = backoff.base_delay(attempt);
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(
                delay < floor.mul_f64(1.0 + JITTER_FRACTION) + Duration::from_millis(1),
                "attempt {attempt}: {delay:?} too large"
            );
            assert!(floor <= cap);
        }
    }

    #[test]
    fn test_cap_applies_before_jitter() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 0);
        assert_eq!(backoff.base_delay(4), Duration::from_secs(16));
        assert_eq!(backoff.base_delay(5), Duration::from_secs(30));
        assert_eq!(backoff.base_delay(200), Duration::from_secs(30));
    }

    #[test]
    fn test_unlimited_attempts() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), 0);
        for _ in 0..1000 {
            assert!(backoff.next_delay().is_some());
        }
        assert!(!backoff.is_exhausted());
    }

    #[test]
    fn test_reset_clears_attempts() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(100), 2)
                .without_jitter();
        backoff.next_delay();
        backoff.next_delay();
        assert!(backoff.next_delay().is_none());

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }
}
