use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `min(base * 2^failures, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    /// Delay after `consecutive_failures` earlier failures.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        2u32.checked_pow(consecutive_failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Idle delay between polls: `interval + uniform(0, jitter)`.
pub fn idle_delay(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
    interval + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(60));

        assert_eq!(backoff.delay(0), Duration::from_secs(10));
        assert_eq!(backoff.delay(1), Duration::from_secs(20));
        assert_eq!(backoff.delay(2), Duration::from_secs(40));
        assert_eq!(backoff.delay(3), Duration::from_secs(60));
        assert_eq!(backoff.delay(200), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_is_monotonic() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(1800));
        let delays: Vec<Duration> = (0..64).map(|n| backoff.delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1800));
    }

    #[test]
    fn test_cap_below_base_is_raised() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_secs(10));
    }

    #[test]
    fn test_idle_delay_within_jitter() {
        let interval = Duration::from_secs(300);
        let jitter = Duration::from_secs(30);
        for _ in 0..100 {
            let delay = idle_delay(interval, jitter);
            assert!(delay >= interval && delay <= interval + jitter);
        }
        assert_eq!(idle_delay(interval, Duration::ZERO), interval);
    }
}
