// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two distinct uses live here:
//! - [`retry`] wraps an async operation (backend connect, schema setup)
//!   and retries it in place with [`RetryConfig`] presets.
//! - [`BackoffPolicy`] computes when a failed sync delivery may be tried
//!   again. The scheduler stores the deadline and moves on, no sleeping.
//!
//! # Example
//!
//! ```
//! use loom_store::{BackoffPolicy, RetryConfig};
//! use std::time::Duration;
//!
//! // Opening a backend: five attempts, then give up
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//!
//! // Delivery backoff: 1s, 2s, 4s ... capped
//! let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300));
//! assert_eq!(policy.delay_for(1, None), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(3, None), Duration::from_secs(4));
//! assert_eq!(policy.delay_for(3, Some(Duration::from_secs(3))), Duration::from_secs(3));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Delay before the next delivery attempt of a failed sync record.
///
/// `delay = min(base * 2^(attempts - 1), cap)` where `cap` is the table's
/// `max_delay_seconds` when it has one, or the engine-wide ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_backoff: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base: Duration, max_backoff: Duration) -> Self {
        Self { base, max_backoff }
    }

    /// `attempts` counts failures so far (1 after the first failure).
    #[must_use]
    pub fn delay_for(&self, attempts: u32, max_delay: Option<Duration>) -> Duration {
        let cap = max_delay.unwrap_or(self.max_backoff);
        let exponent = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
            .min(cap)
    }
}

/// In-place retry of a backend operation.
///
/// Presets:
/// - [`RetryConfig::startup()`] - opening the database, fails fast on bad config
/// - [`RetryConfig::query()`] - single reads and writes
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total tries including the first
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Five attempts over roughly three seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(2)),
        }
    }

    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2)),
        }
    }

    /// Minimal delays, for tests
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(10)),
        }
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is used up,
/// sleeping the policy's backoff in between. Returns the last error.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures: u32 = 0;
    loop {
        match operation().await {
            Ok(val) => {
                if failures > 0 {
                    info!(operation = operation_name, failures, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                failures += 1;
                if failures >= config.max_attempts.max(1) {
                    warn!(operation = operation_name, attempts = failures, error = %err, "Operation failed, giving up");
                    return Err(err);
                }
                let delay = config.backoff.delay_for(failures, None);
                warn!(
                    operation = operation_name,
                    attempt = failures,
                    max_attempts = config.max_attempts,
                    error = %err,
                    retry_in = ?delay,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails until the `succeed_on`th call; 0 never succeeds
    async fn flaky(calls: &AtomicU32, succeed_on: u32) -> Result<&'static str, String> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if succeed_on != 0 && n >= succeed_on {
            Ok("opened")
        } else {
            Err(format!("connection refused ({n})"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_on_third_call() {
        let calls = AtomicU32::new(0);
        let out = retry("open_backend", &RetryConfig::test(), || flaky(&calls, 3)).await;
        assert_eq!(out, Ok("opened"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let calls = AtomicU32::new(0);
        let out = retry("open_backend", &RetryConfig::test(), || flaky(&calls, 0)).await;
        assert_eq!(out, Err("connection refused (3)".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), RetryConfig::test().max_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_never_sleeps() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig { max_attempts: 1, ..RetryConfig::startup() };
        let started = tokio::time::Instant::now();
        assert!(retry("probe", &config, || flaky(&calls, 0)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(10, None), Duration::from_secs(5));
        // Table cap wins over the engine ceiling
        assert_eq!(policy.delay_for(10, Some(Duration::from_secs(2))), Duration::from_secs(2));
        // Huge attempt counts do not overflow
        assert_eq!(policy.delay_for(u32::MAX, None), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_attempts_treated_as_first() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(0, None), Duration::from_secs(1));
    }
}
