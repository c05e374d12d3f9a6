//! Retry policy: exponential backoff with full jitter, separate from the
//! circuit breaker (§4.1, §4.4). Mutating retries require an idempotency
//! token; callers pass one in so a retried submit never double-submits.

use crate::error::AppError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(8),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Full-jitter exponential backoff: `rand(0, min(cap, base * 2^attempt))`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << attempt.min(20));
        let capped = exp.min(self.cap.as_millis());
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jittered as u64)
    }
}

/// Runs `op` up to `policy.max_attempts` times, sleeping with full-jitter
/// backoff between retriable failures. Fatal errors (4xx-shaped /
/// validation) return immediately without retrying.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retriable() || attempt + 1 >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.backoff_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            max_attempts: 5,
        };
        let attempts = AtomicU32::new(0);
        let result = retry(&policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::Network("boom".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_never_retry() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let result: Result<(), AppError> = retry(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::Validation("bad input".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts() {
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: 3,
        };
        let attempts = AtomicU32::new(0);
        let result: Result<(), AppError> = retry(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::Network("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
