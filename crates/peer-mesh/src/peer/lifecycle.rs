//! Reconnection decisions
//!
//! [`ReconnectionPolicy::decide`] is a pure function of the attempt count
//! and the kind of failure. The session event loop owns the timers that
//! act on its answers.

use crate::config::{BackoffKind, ReconnectConfig};
use std::time::Duration;

/// What went wrong with a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transport reported `failed`
    Failed,
    /// Transport reported `disconnected`; `rechecked` once the grace period passed
    Disconnected {
        /// Whether the grace-period recheck already happened
        rechecked: bool,
    },
    /// An offer, answer or connect deadline elapsed
    Timeout,
}

/// Outcome of a policy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Restart after `after`; this will be attempt number `attempt`
    Retry {
        /// Delay before restarting
        after: Duration,
        /// 1-based attempt number
        attempt: u32,
    },
    /// Look again after `after` without counting an attempt
    Recheck {
        /// Grace period
        after: Duration,
    },
    /// Stop trying and close the link
    GiveUp,
}

/// Bounded-retry reconnection policy
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionPolicy {
    /// Maximum number of restart attempts (default: 5)
    pub max_attempts: u32,
    /// Backoff curve (default: linear)
    pub backoff: BackoffKind,
    /// Backoff unit in milliseconds (default: 3000ms)
    pub backoff_step_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 30000ms)
    pub backoff_max_ms: u64,
    /// Exponential multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Recheck delay after `disconnected` (default: 5000ms)
    pub disconnect_grace_ms: u64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectionPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff,
            backoff_step_ms: config.backoff_step_ms,
            backoff_max_ms: config.backoff_max_ms,
            backoff_multiplier: config.backoff_multiplier,
            disconnect_grace_ms: config.disconnect_grace_ms,
        }
    }
}

impl ReconnectionPolicy {
    /// Decide what to do after `failure`, given `attempts` restarts so far
    pub fn decide(&self, attempts: u32, failure: FailureKind) -> Decision {
        if let FailureKind::Disconnected { rechecked: false } = failure {
            return Decision::Recheck {
                after: Duration::from_millis(self.disconnect_grace_ms),
            };
        }

        if !self.should_retry(attempts) {
            return Decision::GiveUp;
        }

        let attempt = attempts + 1;
        Decision::Retry {
            after: self.calculate_backoff(attempt),
            attempt,
        }
    }

    /// Backoff before 1-based attempt number `attempt`
    ///
    /// Linear: `step × attempt`. Exponential: `step × multiplier^(attempt-1)`.
    /// Both are clamped to `backoff_max_ms`.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let backoff_ms = match self.backoff {
            BackoffKind::Linear => self.backoff_step_ms.saturating_mul(attempt as u64) as f64,
            BackoffKind::Exponential => {
                (self.backoff_step_ms as f64) * self.backoff_multiplier.powi(attempt as i32 - 1)
            }
        };

        // Clamp to maximum
        let backoff_ms = backoff_ms.min(self.backoff_max_ms as f64);
        Duration::from_millis(backoff_ms as u64)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
