use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponential reconnection delay: `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: &ReconnectConfig) -> Self {
        Self {
            initial: cfg.initial_delay,
            max: cfg.max_delay,
            multiplier: cfg.multiplier,
            attempt: 0,
        }
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.multiplier.powi(self.attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial.as_secs_f64() * factor;

        // Overflowed or non-finite products saturate at the cap.
        let delay = if secs.is_finite() && secs < self.max.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max
        };

        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Consecutive failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(initial_ms: u64, max_ms: u64, multiplier: f64) -> Backoff {
        Backoff::new(&ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
        })
    }

    #[test]
    fn test_grows_exponentially_until_cap() {
        let mut b = backoff(1000, 30_000, 2.0);
        let delays: Vec<u64> = (0..7).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
        assert_eq!(b.attempt(), 7);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut b = backoff(100, 10_000, 3.0);
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_multiplier_one_is_constant() {
        let mut b = backoff(500, 10_000, 1.0);
        for _ in 0..5 {
            assert_eq!(b.next_delay(), Duration::from_millis(500));
        }
    }

    #[test]
    fn test_many_attempts_saturate_at_max() {
        let mut b = backoff(1000, 60_000, 10.0);
        for _ in 0..2000 {
            assert!(b.next_delay() <= Duration::from_secs(60));
        }
        assert_eq!(b.next_delay(), Duration::from_secs(60));
    }
}
