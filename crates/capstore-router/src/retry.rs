//! Write Retry Policy
//!
//! Bounded exponential backoff for routed writes.
//!
//! ## Why Retry Writes?
//!
//! A write can find the cluster in a state where it cannot land yet:
//! - **No write target**: the old target was demoted or went unreachable and the
//!   provisioner has not committed a replacement.
//! - **Transient store failure**: the target is busy, locked or restarting.
//! - **Timeout**: the target did not answer within `write_timeout_ms`.
//!
//! All three usually clear within seconds, so the router retries before
//! surfacing a caller-visible error.
//!
//! ## Backoff Strategy
//!
//! ```text
//! Attempt 1: wait   50ms
//! Attempt 2: wait  100ms  (50ms × 2)
//! Attempt 3: wait  200ms  (100ms × 2)
//! Attempt 4: wait  400ms  (200ms × 2)
//! Attempt 5: give up
//! ```
//!
//! While there is no write target the wait also ends early as soon as the
//! registry commits a new version, so a write resumes right after provisioning.
//!
//! ## Never Retried
//!
//! - Storage full on the write target
//! - Duplicate key
//! - Schema errors or invalid connection info

use capstore_core::RouterConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    pub initial_backoff: Duration,

    /// Upper bound for any single wait.
    pub max_backoff: Duration,

    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(
            config.max_write_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.backoff_multiplier,
        )
    }

    /// Wait before the attempt that follows failed attempt number `attempt`
    /// (0-indexed).
    ///
    /// Formula: `min(initial_backoff × multiplier^attempt, max_backoff)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_backoff.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff_ms = initial_ms * self.backoff_multiplier.powi(exponent);
        let max_ms = self.max_backoff.as_millis() as f64;

        Duration::from_millis(backoff_ms.min(max_ms) as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
