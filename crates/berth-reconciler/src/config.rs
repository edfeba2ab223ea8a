//! Reconciler configuration

use std::time::Duration;

/// Capped exponential backoff with an attempt limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Attempts before giving up
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempts` (1-based).
    pub fn delay(&self, attempts: u32) -> Duration {
        crate::backoff::backoff_delay(attempts, self.base_delay, self.max_delay)
    }

    /// Whether `attempts` failures use up the policy.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Restart budget applied to crashed instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartBudget {
    /// Restarts allowed inside `window`
    pub max_restarts: u32,

    /// Rolling window restarts are counted in
    pub window: Duration,

    /// Running (and not unhealthy) this long clears the restart history
    pub reset_after: Duration,

    /// Delay before the first restart
    pub base_delay: Duration,

    /// Upper bound for the restart delay
    pub max_delay: Duration,
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(600),
            reset_after: Duration::from_secs(300),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval of the periodic full reconcile
    pub tick_interval: Duration,

    /// Services reconciled concurrently in one pass
    pub workers: usize,

    /// Grace period given to containers on stop
    pub stop_grace: Duration,

    /// Retry policy for transient provisioning failures
    pub retry: RetryPolicy,

    /// Restart budget for crashed instances
    pub restart: RestartBudget,

    /// Backoff for re-subscribing to runtime events
    pub event_reconnect: RetryPolicy,

    /// Log lines captured from an instance before it is removed
    pub retained_log_lines: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            workers: 4,
            stop_grace: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            restart: RestartBudget::default(),
            event_reconnect: RetryPolicy {
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                max_attempts: u32::MAX,
            },
            retained_log_lines: 100,
        }
    }
}
