//! Exponential backoff with jitter for broker reconnects.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `base * 2^attempt`, capped, with up to 25% jitter
/// subtracted so reconnecting processes do not stampede the broker in
/// lockstep.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and capped at `cap`.
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// The delay for the next attempt, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_range = capped.as_millis() as u64 / 4;
        let jitter = if jitter_range == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_range)
        };
        capped.saturating_sub(Duration::from_millis(jitter))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(30));
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        let third = backoff.next_delay();

        // With 25% max jitter the floors are 150ms, 300ms, 600ms.
        assert!(first >= Duration::from_millis(150));
        assert!(second >= Duration::from_millis(300));
        assert!(third >= Duration::from_millis(600));
        assert!(third <= Duration::from_millis(800));
    }

    #[test]
    fn delay_respects_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(2));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(2));
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(30));
        for _ in 0..5 {
            let _ = backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 5);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(200));
    }

    #[test]
    fn large_attempt_counts_do_not_overflow() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(30));
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(30));
        }
    }
}
