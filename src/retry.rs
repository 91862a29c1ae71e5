//! Exponential-backoff retry for external calls.
//!
//! Wraps any fallible async operation. Transient failures (classified by
//! the caller) are retried with doubling delays; the last error is
//! surfaced once attempts are exhausted. Stages record a signal and skip
//! the offending row instead of failing the batch.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

/// Hard ceiling on attempts regardless of configuration.
pub const MAX_ATTEMPTS_CAP: u32 = 5;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_CAP),
            base_delay: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }
}

/// Run `op` until it succeeds, a non-retryable error occurs, or attempts
/// run out. Delays double per attempt: base, 2×base, 4×base, capped at
/// 32×base.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    is_retryable: impl Fn(&anyhow::Error) -> bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let factor = 1u32 << (attempt - 1).min(5);
            tokio::time::sleep(policy.base_delay * factor).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry_with_backoff: no attempts made")))
}

/// Classifier for HTTP-shaped errors: rate limits and server errors are
/// transient, other client errors are not.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts).with_base_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(3), |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(7) }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(3), |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    anyhow::bail!("transient");
                }
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&fast_policy(3), |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("always down") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&fast_policy(5), |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("bad request") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attempts_are_capped() {
        assert_eq!(RetryPolicy::new(99).max_attempts, MAX_ATTEMPTS_CAP);
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }

    #[test]
    fn status_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
    }
}
