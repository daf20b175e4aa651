//! Bounded retry for transient operations
//!
//! A small retry helper used where a component owns a bounded retry budget
//! of its own, such as initial node registration (a fixed number of
//! attempts spaced one membership sync period apart). Loops that retry
//! naturally on their next tick do not use this.

use std::time::Duration;

use tracing::{error, warn};

/// Policy for an operation that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least 1)
    pub max_attempts: u32,
    /// Delay between attempts
    pub interval: Duration,
    /// Multiplier applied to the interval after each failure (1.0 = fixed)
    pub backoff_multiplier: f64,
    /// Upper bound on the delay when backing off
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// Fixed-interval policy: `max_attempts` tries, `interval` apart
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            backoff_multiplier: 1.0,
            max_interval: interval,
        }
    }

    /// Exponential policy doubling up to `max_interval`
    pub fn exponential(max_attempts: u32, initial: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval: initial,
            backoff_multiplier: 2.0,
            max_interval,
        }
    }
}

/// Execute an async operation under the given policy
///
/// Returns the first success, or the last error once the attempt budget is
/// exhausted.
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = policy.interval;

    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt == policy.max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "operation failed, attempt budget exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.backoff_multiplier)
                        .min(policy.max_interval.as_secs_f64()),
                );
            }
        }
    }

    unreachable!("max_attempts is clamped to at least 1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_immediately() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let result: Result<i32, &str> = retry(&policy, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<i32, &str> = retry(&policy, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempt_budget() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let result: Result<i32, &str> = retry(&policy, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::fixed(0, Duration::from_millis(1));
        assert_eq!(policy.max_attempts, 1);

        let result: Result<i32, &str> = retry(&policy, "op", || async { Err("nope") }).await;
        assert_eq!(result, Err("nope"));
    }
}
