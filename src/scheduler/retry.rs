// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-record delivery attempts.
//!
//! A failed record either waits out its backoff or, once it has used
//! `retry_count` attempts, becomes failed-terminal. The delay itself comes
//! from [`BackoffPolicy`].

use chrono::{DateTime, Utc};

use crate::registry::SyncPolicy;
use crate::resilience::retry::BackoffPolicy;

/// Failures so far and the earliest time of the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub not_before: DateTime<Utc>,
}

impl RetryState {
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(RetryState),
    Exhausted { attempts: u32 },
}

/// What happens to a record after one more failed delivery.
#[must_use]
pub fn after_failure(
    backoff: &BackoffPolicy,
    policy: &SyncPolicy,
    previous_attempts: u32,
    now: DateTime<Utc>,
) -> RetryDecision {
    let attempts = previous_attempts.saturating_add(1);
    if attempts >= policy.retry_count {
        return RetryDecision::Exhausted { attempts };
    }
    let delay = backoff.delay_for(attempts, policy.max_delay);
    let not_before = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    RetryDecision::Retry(RetryState { attempts, not_before })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SyncPriority;
    use chrono::TimeZone;
    use std::time::Duration;

    fn policy(retry_count: u32, max_delay: Option<Duration>) -> SyncPolicy {
        SyncPolicy { priority: SyncPriority::High, batch_size: 10, max_delay, retry_count }
    }

    #[test]
    fn test_three_attempts_then_terminal() {
        let backoff = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300));
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let p = policy(3, None);

        let RetryDecision::Retry(first) = after_failure(&backoff, &p, 0, now) else {
            panic!("first failure should retry");
        };
        assert_eq!(first.attempts, 1);
        assert_eq!(first.not_before, now + chrono::Duration::seconds(1));
        assert!(!first.is_due(now));
        assert!(first.is_due(first.not_before));

        let RetryDecision::Retry(second) = after_failure(&backoff, &p, 1, now) else {
            panic!("second failure should retry");
        };
        assert_eq!(second.not_before, now + chrono::Duration::seconds(2));

        assert_eq!(after_failure(&backoff, &p, 2, now), RetryDecision::Exhausted { attempts: 3 });
    }

    #[test]
    fn test_table_max_delay_caps_backoff() {
        let backoff = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(300));
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let p = policy(10, Some(Duration::from_secs(15)));
        let RetryDecision::Retry(state) = after_failure(&backoff, &p, 4, now) else {
            panic!("should retry");
        };
        assert_eq!(state.not_before, now + chrono::Duration::seconds(15));
    }
}
