//! Exponential reconnect backoff

use std::time::Duration;

/// `min(base * 2^(n-1), cap)` for reconnect attempt `n` (1-indexed)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt`. Attempt 0 waits nothing.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn has_remaining(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(d: Duration) -> u128 {
        d.as_millis()
    }

    #[test]
    fn test_default_schedule() {
        let backoff = Backoff::default();
        let delays: Vec<u128> = (1..=5).map(|n| ms(backoff.delay(n))).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(ms(backoff.delay(6)), 30_000);
        assert_eq!(ms(backoff.delay(40)), 30_000);
        assert_eq!(ms(backoff.delay(u32::MAX)), 30_000);
    }

    #[test]
    fn test_remaining_attempts() {
        let backoff = Backoff::default();
        assert!(backoff.has_remaining(4));
        assert!(!backoff.has_remaining(5));
    }
}
