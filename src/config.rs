//! Coordinator, reaper and recovery configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Store type under which top-level coordinators keep their intentions log
pub const COORDINATOR_TYPE: &str = "/Transaction/Coordinator";

/// Store type for interposed (subordinate) coordinators
pub const SUBORDINATE_TYPE: &str = "/Transaction/Coordinator/Subordinate";

/// Retry policy with exponential backoff
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_millis: u64,
    /// Maximum delay cap (milliseconds)
    pub max_delay_millis: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_millis: 1000,
            max_delay_millis: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a given attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.initial_delay_millis as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = delay.min(self.max_delay_millis as f64);
        Duration::from_millis(capped as u64)
    }

    /// Policy used for lock acquisition: a handful of short waits
    pub fn lock_acquisition() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_millis: 10,
            max_delay_millis: 200,
            backoff_multiplier: 2.0,
        }
    }

    /// Policy that never sleeps, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_millis: 0,
            max_delay_millis: 0,
            backoff_multiplier: 1.0,
        }
    }
}

/// Recovery subsystem settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Period between background scans (milliseconds)
    pub scan_period_millis: u64,
    /// Backoff between replay attempts of one transaction
    pub replay_backoff: RetryPolicy,
    /// Attempts before an unresolved log is quarantined (hidden)
    pub max_replay_attempts: u32,
    /// Store types holding coordinator logs
    pub recovery_types: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_period_millis: 120_000,
            replay_backoff: RetryPolicy {
                max_attempts: 10,
                initial_delay_millis: 60_000,
                max_delay_millis: 600_000,
                backoff_multiplier: 2.0,
            },
            max_replay_attempts: 10,
            recovery_types: vec![COORDINATOR_TYPE.to_owned(), SUBORDINATE_TYPE.to_owned()],
        }
    }
}

impl RecoveryConfig {
    /// Scan period as a duration
    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_millis)
    }
}

/// Top-level settings for a process context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Node identifier folded into every uid
    pub node_id: u64,
    /// Default transaction timeout (milliseconds, 0 = none)
    pub default_timeout_millis: u64,
    /// Allow the one-phase commit optimization
    pub one_phase_commit: bool,
    /// Reaper wake-up interval (milliseconds)
    pub reaper_interval_millis: u64,
    /// Lock acquisition retries
    pub lock_retry: RetryPolicy,
    /// Recovery settings
    pub recovery: RecoveryConfig,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            default_timeout_millis: 60_000,
            one_phase_commit: true,
            reaper_interval_millis: 1_000,
            lock_retry: RetryPolicy::lock_acquisition(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl TransactionConfig {
    /// Set the node id
    pub fn with_node_id(mut self, node_id: u64) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the default timeout; `None` disables it
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout_millis = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
        self
    }

    /// Enable or disable one-phase commit
    pub fn with_one_phase_commit(mut self, enabled: bool) -> Self {
        self.one_phase_commit = enabled;
        self
    }

    /// Set the reaper interval
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval_millis = interval.as_millis() as u64;
        self
    }

    /// Set the lock retry policy
    pub fn with_lock_retry(mut self, policy: RetryPolicy) -> Self {
        self.lock_retry = policy;
        self
    }

    /// Set recovery settings
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// Default timeout as a duration
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_millis > 0).then(|| Duration::from_millis(self.default_timeout_millis))
    }

    /// Reaper interval as a duration
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_millis.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(0));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        // Would be 8000 but capped at max
        assert!(policy.delay_for_attempt(10) <= Duration::from_millis(30000));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: TransactionConfig =
            serde_json::from_str(r#"{"node_id": 7, "recovery": {"max_replay_attempts": 2}}"#)
                .unwrap();
        assert_eq!(config.node_id, 7);
        assert!(config.one_phase_commit);
        assert_eq!(config.recovery.max_replay_attempts, 2);
        assert_eq!(config.recovery.recovery_types.len(), 2);
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn zero_timeout_means_none() {
        let config = TransactionConfig::default().with_default_timeout(None);
        assert_eq!(config.default_timeout(), None);
    }
}
