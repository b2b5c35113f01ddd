use std::time::Duration;

use crate::config::ClientConfig;

/// Floor for both delays, so a zero setting cannot spin.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Doubling reconnect delay, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(MIN_DELAY);
        let base = base.clamp(MIN_DELAY, max);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.reconnect_base(), config.reconnect_max())
    }

    /// The delay to wait now; the following one doubles.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    #[cfg(test)]
    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_doubles_until_capped() {
        let mut b = Backoff::new(ms(500), ms(3000));
        let delays: Vec<_> = (0..6).map(|_| b.next_delay()).collect();
        assert_eq!(delays, vec![ms(500), ms(1000), ms(2000), ms(3000), ms(3000), ms(3000)]);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut b = Backoff::new(ms(100), ms(10_000));
        b.next_delay();
        b.next_delay();
        assert_eq!(b.current(), ms(400));
        b.reset();
        assert_eq!(b.next_delay(), ms(100));
    }

    #[test]
    fn test_base_above_max_is_clamped() {
        let mut b = Backoff::new(ms(5000), ms(1000));
        assert_eq!(b.next_delay(), ms(1000));
        assert_eq!(b.next_delay(), ms(1000));
    }

    #[test]
    fn test_zero_delays_floored() {
        let mut b = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(b.next_delay(), ms(1));
        assert_eq!(b.next_delay(), ms(1));

        let mut b = Backoff::new(Duration::ZERO, ms(4));
        let delays: Vec<_> = (0..4).map(|_| b.next_delay()).collect();
        assert_eq!(delays, vec![ms(1), ms(2), ms(4), ms(4)]);
    }

    #[test]
    fn test_from_config_defaults() {
        let mut b = Backoff::from_config(&ClientConfig::default());
        assert_eq!(b.next_delay(), ms(500));
        assert_eq!(b.next_delay(), ms(1000));
    }
}
