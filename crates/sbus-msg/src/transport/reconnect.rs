//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
use std::time::Duration;

use sbus_common::ReconnectConfig;

/// Bounded exponential backoff for broker reconnection.
///
/// Each consecutive failure consumes one attempt; a successful connection
/// resets the budget.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    failures: usize,
}

impl ReconnectPolicy {
    /// Policy allowing `max_attempts` consecutive failures.
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
            failures: 0,
        }
    }

    /// Delay before the `attempt`-th retry (1-indexed).
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = (attempt.saturating_sub(1) as u32).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }

    /// Register a failure. Returns the delay to wait, or `None` once exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.failures >= self.max_attempts {
            return None;
        }
        self.failures += 1;
        Some(self.backoff_delay(self.failures))
    }

    /// Clear the failure count after a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures so far.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Whether no attempts remain.
    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.max_attempts
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay, config.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let mut policy =
            ReconnectPolicy::new(5, Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<_> = std::iter::from_fn(|| policy.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn reset_restores_budget() {
        let mut policy = ReconnectPolicy::new(1, Duration::from_millis(10), Duration::from_secs(1));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        policy.reset();
        assert_eq!(policy.failures(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn zero_attempts_never_retries() {
        let mut policy = ReconnectPolicy::new(0, Duration::from_millis(10), Duration::from_secs(1));
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_delay(), None);
    }
}
