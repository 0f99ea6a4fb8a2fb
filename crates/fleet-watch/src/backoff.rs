//! Reconnection policy.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Retry and timeout policy for one watch.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct BackoffPolicy {
    /// Consecutive transient failures tolerated before the watch gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base connection lifetime (unit: milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Upper bound of the random extra lifetime per connection (unit: milliseconds)
    #[serde(default = "default_timeout_jitter_ms")]
    pub timeout_jitter_ms: u64,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Wait after a 404 (unit: milliseconds)
    #[serde(default = "default_not_found_delay_ms")]
    pub not_found_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            timeout_jitter_ms: default_timeout_jitter_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            not_found_delay_ms: default_not_found_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_timeout_ms() -> u64 {
    4 * 60 * 1000
}
fn default_timeout_jitter_ms() -> u64 {
    30 * 1000
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60 * 1000
}
fn default_not_found_delay_ms() -> u64 {
    5 * 60 * 1000
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero based): the base doubled per attempt, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Lifetime of the next connection, with jitter.
    pub fn connection_timeout(&self) -> Duration {
        let jitter = if self.timeout_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.timeout_jitter_ms)
        };
        Duration::from_millis(self.timeout_ms + jitter)
    }

    /// Wait after the kind was not found.
    pub fn not_found_delay(&self) -> Duration {
        Duration::from_millis(self.not_found_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(60));
        assert_eq!(policy.delay(200), Duration::from_secs(60));
    }

    #[test]
    fn timeout_has_bounded_jitter() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let timeout = policy.connection_timeout();
            assert!(timeout >= Duration::from_secs(240));
            assert!(timeout < Duration::from_secs(270));
        }

        let fixed = BackoffPolicy {
            timeout_jitter_ms: 0,
            ..BackoffPolicy::default()
        };
        assert_eq!(fixed.connection_timeout(), Duration::from_secs(240));
    }
}
