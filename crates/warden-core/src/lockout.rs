//! Exponential lockout policy for failed PIN attempts
//!
//! Once `threshold` consecutive failures land inside the rolling window, every
//! further failure doubles the lockout, starting from `base_backoff_secs`:
//!
//! - 1-4 failures: no lockout (allow typos)
//! - 5 failures: 30 seconds
//! - 6 failures: 1 minute
//! - 7 failures: 2 minutes
//! - ... capped at 24 hours

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lockout policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutPolicy {
    /// Consecutive failures before the first lockout
    pub threshold: u32,
    /// First lockout duration
    pub base_backoff_secs: u64,
    /// Longest lockout ever applied
    pub max_backoff_secs: u64,
    /// A failure older than this no longer counts towards the streak
    pub failure_window_secs: u64,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            base_backoff_secs: 30,
            max_backoff_secs: 24 * 60 * 60,
            failure_window_secs: 15 * 60,
        }
    }
}

impl LockoutPolicy {
    /// Lockout duration after `failed_attempts` consecutive failures.
    /// Returns `None` while still under the threshold.
    pub fn backoff(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts < self.threshold {
            return None;
        }

        let level = (failed_attempts - self.threshold).min(32);
        let secs = self
            .base_backoff_secs
            .saturating_mul(1u64 << level)
            .min(self.max_backoff_secs);

        Some(Duration::from_secs(secs))
    }

    /// Rolling window as a duration
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    /// Attempts left before the next failure triggers a lockout
    pub fn attempts_remaining(&self, failed_attempts: u32) -> u32 {
        self.threshold.saturating_sub(failed_attempts)
    }

    /// Human-readable description of the current lockout state
    pub fn describe(&self, failed_attempts: u32) -> String {
        match self.backoff(failed_attempts) {
            Some(duration) => {
                let secs = duration.as_secs();
                if secs < 60 {
                    format!("Locked for {} seconds", secs)
                } else if secs < 3600 {
                    format!("Locked for {} minutes", secs / 60)
                } else {
                    format!("Locked for {} hours", secs / 3600)
                }
            }
            None => format!(
                "{} attempts remaining",
                self.attempts_remaining(failed_attempts)
            ),
        }
    }
}
