//! Bounded retry with exponential backoff and jitter.
//!
//! One policy serves every outbound call: the delay doubles per attempt,
//! is capped, and carries ±25% jitter to prevent thundering herd when many
//! workers lose the backend at once.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use kiln_types::config::RetryConfig;
use kiln_types::errors::KilnError;

/// Retry budget for an outbound operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never zero.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before the retry following `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)`, capped at `max_delay`, with ±25% jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let backoff = self.base_delay.saturating_mul(multiplier.min(u32::MAX as u64) as u32);
        let capped = backoff.min(self.max_delay);

        let jitter_range = capped.as_millis() as u64 / 4;
        if jitter_range == 0 {
            return capped;
        }
        let offset = rand::thread_rng().gen_range(0..=jitter_range * 2) as i64 - jitter_range as i64;
        let delayed_ms = capped.as_millis() as i64 + offset;
        Duration::from_millis(delayed_ms.max(1) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `call` up to `policy.max_attempts` times, sleeping between attempts.
///
/// Returns the first success or the last error once the budget is spent.
/// Intermediate failures are logged at debug with the operation name.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, KilnError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, KilnError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts => {
                tracing::warn!(
                    operation,
                    attempts = attempt,
                    "retry budget exhausted: {e}"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, backing off: {e}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(3), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, KilnError>(42) }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(5), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(KilnError::Backend("transient".to_string()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&fast_policy(3), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(KilnError::Backend("down".to_string())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            KilnError::Backend(msg) => assert_eq!(msg, "down"),
            other => panic!("expected Backend error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_attempt_policy_never_sleeps() {
        let calls = AtomicU32::new(0);
        let _ = retry_with_backoff(&fast_policy(1), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(KilnError::Backend("down".to_string())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_growth_within_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(10_000),
        };

        // attempt 1 => ~100ms, attempt 2 => ~200ms, attempt 3 => ~400ms,
        // each ±25%.
        for (attempt, expected_ms) in [(1u32, 100i64), (2, 200), (3, 400)] {
            let delay = policy.delay_after(attempt).as_millis() as i64;
            let lower = expected_ms * 3 / 4;
            let upper = expected_ms * 5 / 4;
            assert!(
                delay >= lower && delay <= upper,
                "attempt {attempt}: expected {lower}..={upper}ms, got {delay}ms"
            );
        }
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 20,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        // 100ms * 2^14 would be far past the cap.
        let delay = policy.delay_after(15).as_millis() as u64;
        assert!(delay <= 1_250, "expected capped at ~1000ms +25%, got {delay}ms");
    }

    #[test]
    fn test_from_config_floors_attempts_at_one() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            base_delay_ms: 10,
            max_delay_ms: 100,
        });
        assert_eq!(policy.max_attempts, 1);
    }
}
