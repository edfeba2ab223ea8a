//! Retry delays and restart accounting

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Delay before retry number `attempts`: `base * 2^(attempts-1)`, capped at `max`.
///
/// Zero attempts means no delay.
pub fn backoff_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let exponent = (attempts - 1).min(31);
    let factor = 1u32 << exponent;
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Rolling window of restart times
#[derive(Debug, Clone, Default)]
pub struct RestartHistory {
    restarts: VecDeque<Instant>,
}

impl RestartHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, at: Instant) {
        self.restarts.push_back(at);
    }

    /// Restarts inside `window` ending at `now`. Older entries are dropped.
    pub fn count_within(&mut self, now: Instant, window: Duration) -> u32 {
        while let Some(oldest) = self.restarts.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.restarts.is_empty()
    }

    pub fn clear(&mut self) {
        self.restarts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(0, base, max), Duration::ZERO);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(4, base, max), Duration::from_millis(800));
        assert_eq!(backoff_delay(5, base, max), max);
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_forgets_restarts_outside_window() {
        let window = Duration::from_secs(60);
        let mut history = RestartHistory::new();
        history.record(Instant::now());
        tokio::time::advance(Duration::from_secs(30)).await;
        history.record(Instant::now());
        assert_eq!(history.count_within(Instant::now(), window), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(history.count_within(Instant::now(), window), 1);

        history.clear();
        assert!(history.is_empty());
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_bounded(attempts in 1u32..64, base_ms in 1u64..5_000, max_ms in 1u64..600_000) {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(max_ms);
            let delay = backoff_delay(attempts, base, max);
            prop_assert!(delay <= max);
            prop_assert!(backoff_delay(attempts + 1, base, max) >= delay);
        }
    }
}
