//! Failed PIN attempt tracking
//!
//! Enforcement runs on the monotonic clock. The wall-clock time of the last
//! failure is kept alongside so the streak (and any active lockout) survives
//! a process restart through the metadata record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::warn;

use crate::error::AuthError;
use crate::lockout::LockoutPolicy;

#[derive(Debug, Default)]
pub(crate) struct FailedAttempts {
    count: u32,
    last_failure: Option<Instant>,
    last_failed_at: Option<DateTime<Utc>>,
    lockout_until: Option<Instant>,
    /// Wall-clock mirror of `lockout_until`, fixed when the lockout starts
    lockout_ends_at: Option<DateTime<Utc>>,
}

impl FailedAttempts {
    /// Rebuild from persisted values
    pub fn restore(
        count: u32,
        last_failed_at: Option<DateTime<Utc>>,
        policy: &LockoutPolicy,
    ) -> Self {
        let Some(failed_at) = last_failed_at else {
            return Self {
                count,
                ..Default::default()
            };
        };

        let now = Instant::now();
        // A timestamp from the future (clock change) counts as "just now"
        let elapsed = (Utc::now() - failed_at).to_std().unwrap_or(Duration::ZERO);

        if elapsed > policy.failure_window() && policy.backoff(count).map_or(true, |b| elapsed > b) {
            return Self::default();
        }

        let last_failure = now.checked_sub(elapsed).unwrap_or(now);
        let remaining = policy
            .backoff(count)
            .and_then(|backoff| backoff.checked_sub(elapsed));
        let lockout_until = remaining.map(|remaining| now + remaining);
        let lockout_ends_at = remaining
            .and(policy.backoff(count))
            .and_then(|backoff| chrono::Duration::from_std(backoff).ok())
            .map(|backoff| failed_at + backoff);

        if let Some(until) = lockout_until {
            warn!(
                "Restored lockout: {} failed attempts, {}s remaining",
                count,
                until.duration_since(now).as_secs()
            );
        }

        Self {
            count,
            last_failure: Some(last_failure),
            last_failed_at: Some(failed_at),
            lockout_until,
            lockout_ends_at,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn last_failed_at(&self) -> Option<DateTime<Utc>> {
        self.last_failed_at
    }

    /// Fail with `LockedOut` while a lockout is running
    pub fn check(&self) -> Result<(), AuthError> {
        if let Some(until) = self.lockout_until {
            let now = Instant::now();
            if now < until {
                let remaining = until.duration_since(now);
                // Round up so "0 seconds" is never reported
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                return Err(AuthError::LockedOut(secs));
            }
        }
        Ok(())
    }

    /// Wall-clock end of the running lockout, if any
    pub fn lockout_until(&self) -> Option<DateTime<Utc>> {
        let until = self.lockout_until?;
        if Instant::now() >= until {
            return None;
        }
        self.lockout_ends_at
    }

    /// Record one failure and return the attempts left before lockout
    pub fn record_failure(&mut self, policy: &LockoutPolicy) -> u32 {
        let now = Instant::now();

        if let Some(last) = self.last_failure {
            if now.duration_since(last) > policy.failure_window() {
                self.count = 0;
            }
        }

        self.count = self.count.saturating_add(1);
        let failed_at = Utc::now();
        self.last_failure = Some(now);
        self.last_failed_at = Some(failed_at);

        if let Some(backoff) = policy.backoff(self.count) {
            warn!(
                "{} consecutive failed attempts, locking out for {}s",
                self.count,
                backoff.as_secs()
            );
            self.lockout_until = Some(now + backoff);
            self.lockout_ends_at = chrono::Duration::from_std(backoff)
                .ok()
                .map(|backoff| failed_at + backoff);
        }

        policy.attempts_remaining(self.count)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lockout_after_threshold() {
        let policy = LockoutPolicy::default();
        let mut attempts = FailedAttempts::default();

        for expected in (0..5).rev() {
            assert!(attempts.check().is_ok());
            assert_eq!(attempts.record_failure(&policy), expected);
        }

        assert_eq!(attempts.check(), Err(AuthError::LockedOut(30)));
        let until = attempts.lockout_until().unwrap();
        assert_eq!(attempts.lockout_until(), Some(until));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(attempts.check().is_ok());
        assert!(attempts.lockout_until().is_none());

        // Next failure inside the window doubles the backoff
        attempts.record_failure(&policy);
        assert_eq!(attempts.check(), Err(AuthError::LockedOut(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streak_expires_outside_window() {
        let policy = LockoutPolicy::default();
        let mut attempts = FailedAttempts::default();

        for _ in 0..4 {
            attempts.record_failure(&policy);
        }
        tokio::time::advance(policy.failure_window() + Duration::from_secs(1)).await;

        assert_eq!(attempts.record_failure(&policy), 4);
        assert_eq!(attempts.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_active_lockout() {
        let policy = LockoutPolicy::default();
        let failed_at = Utc::now() - chrono::Duration::seconds(10);

        let attempts = FailedAttempts::restore(5, Some(failed_at), &policy);
        match attempts.check() {
            Err(AuthError::LockedOut(secs)) => assert!((19..=21).contains(&secs)),
            other => panic!("Expected lockout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_stale_streak() {
        let policy = LockoutPolicy::default();
        let failed_at = Utc::now() - chrono::Duration::hours(2);

        let attempts = FailedAttempts::restore(3, Some(failed_at), &policy);
        assert_eq!(attempts.count(), 0);
        assert!(attempts.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let policy = LockoutPolicy::default();
        let mut attempts = FailedAttempts::default();
        for _ in 0..6 {
            attempts.record_failure(&policy);
        }
        attempts.reset();
        assert_eq!(attempts.count(), 0);
        assert!(attempts.check().is_ok());
        assert!(attempts.last_failed_at().is_none());
    }
}
