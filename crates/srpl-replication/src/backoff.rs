//! Geometric reconnect backoff.

use std::time::Duration;

/// Reconnect delay that grows by `num / den` on each consecutive error,
/// capped at `max`, and drops back to `min` after a successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    num: u64,
    den: u64,
}

impl ReconnectBackoff {
    pub fn new(min: Duration, max: Duration, num: u64, den: u64) -> Self {
        Self {
            current: min,
            min,
            max: max.max(min),
            num,
            den: den.max(1),
        }
    }

    /// The delay to wait before the next reconnect attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the delay for this error and grow the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown_ms = (self.current.as_millis() as u64 / self.den).saturating_mul(self.num);
        self.current = Duration::from_millis(grown_ms).clamp(self.min, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ReconnectBackoff {
        ReconnectBackoff::new(Duration::from_secs(5), Duration::from_secs(60), 3, 2)
    }

    #[test]
    fn test_backoff_values() {
        let mut b = backoff();
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![5_000, 7_500, 11_250, 16_875, 25_311, 37_965, 56_946, 60_000]
        );
    }

    #[test]
    fn test_backoff_never_decreases_until_reset() {
        let mut b = backoff();
        let mut last = Duration::ZERO;
        for _ in 0..50 {
            let d = b.next_delay();
            assert!(d >= last, "backoff shrank: {d:?} < {last:?}");
            last = d;
        }
        assert_eq!(last, Duration::from_secs(60));

        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_denominator_is_safe() {
        let mut b = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(2), 3, 0);
        b.next_delay();
        assert_eq!(b.current(), Duration::from_secs(2));
    }
}
