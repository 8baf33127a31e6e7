//! Exponential backoff between a failed attempt and its retry.
//!
//! The default schedule is 5s, 15s, 30s, 30s, ... (initial 5s, multiplier 3,
//! capped at 30s).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff schedule applied between `retry_scheduled` and `running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_ms: u64,

    /// Maximum delay between retries, in milliseconds.
    pub max_ms: u64,

    /// Multiplier for exponential backoff (e.g., 3.0 = triple each time).
    pub multiplier: f64,

    /// Whether to add up to 25% jitter to delays.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { initial_ms: 5_000, max_ms: 30_000, multiplier: 3.0, jitter: false }
    }
}

impl BackoffPolicy {
    /// A policy that retries immediately.
    pub fn immediate() -> Self {
        Self { initial_ms: 0, max_ms: 0, multiplier: 1.0, jitter: false }
    }

    /// Calculate the delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
        let capped_delay = base_delay.min(self.max_ms as f64);

        let final_delay = if self.jitter {
            let jitter_factor = 1.0 + (rand_jitter() * 0.25);
            (capped_delay * jitter_factor).min(self.max_ms as f64 * 1.25)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external deps.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = BackoffPolicy { initial_ms: 1_000, max_ms: 5_000, multiplier: 10.0, jitter: false };

        for attempt in 1..10 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(5_000));
        }
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let policy = BackoffPolicy { jitter: true, ..Default::default() };
        let delay = policy.delay_for_attempt(1);

        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(6_250));
    }

    #[test]
    fn test_immediate_policy() {
        let policy = BackoffPolicy::immediate();
        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
    }
}
