//! Exponential backoff with jitter.

use std::time::Duration;

/// `base * 2^attempt`, capped at `max`, plus up to 25% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base_ms: base.as_millis() as u64, max_ms: max.as_millis() as u64, attempt: 0 }
    }

    /// Delay for a given zero-based attempt without touching internal state.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 1u64.checked_shl(attempt).map(|m| self.base_ms.saturating_mul(m)).unwrap_or(u64::MAX);
        let capped = exp.min(self.max_ms);
        let jitter = rand::random::<u64>() % (capped / 4 + 1);
        Duration::from_millis(capped + jitter)
    }

    /// Next delay; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let d = self.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        d
    }

    pub fn reset(&mut self) { self.attempt = 0; }

    pub fn attempt(&self) -> u32 { self.attempt }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let d1 = b.next_delay();
        let d2 = b.next_delay();
        let d3 = b.next_delay();
        assert!(d1.as_millis() >= 100 && d1.as_millis() <= 125);
        assert!(d2.as_millis() >= 200);
        assert!(d3.as_millis() >= 400);
        assert_eq!(b.attempt(), 3);
    }

    #[test]
    fn caps_at_max_plus_jitter() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        for attempt in [0, 3, 10, 63, 64, 200, u32::MAX] {
            assert!(b.delay(attempt).as_millis() <= 625, "attempt {attempt}");
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        for _ in 0..5 {
            b.next_delay();
        }
        b.reset();
        assert!(b.next_delay().as_millis() < 200);
    }
}
