//! Retry policy shared by the generator workers
//!
//! `delay = base * 2^(attempt-1)` with ±10% uniform jitter, clamped below
//! by the base delay. One policy instance per worker, built from config.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Per-attempt deadline.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Backoff before `attempt` (1-based; no delay precedes attempt 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.as_secs_f64() * f64::from(1u32 << exp);
        let jittered = raw * rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(jittered.max(self.base_delay.as_secs_f64()))
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping the policy's backoff
/// between attempts. `op` receives the 1-based attempt number and must apply
/// the per-attempt timeout itself (mapping it into its own error type).
/// Non-retriable errors return immediately.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    is_retriable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retriable(&err) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "attempt failed, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn delay_doubles_within_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
        };
        for attempt in 1..=4u32 {
            let expected = 0.1 * f64::from(1u32 << (attempt - 1));
            let delay = policy.delay_for(attempt).as_secs_f64();
            assert!(delay >= (expected * 0.9) - f64::EPSILON, "attempt {attempt}: {delay}");
            assert!(delay <= (expected * 1.1) + f64::EPSILON, "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn delay_never_drops_below_base() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
        };
        for _ in 0..100 {
            assert!(policy.delay_for(1) >= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_with_backoff(&policy(3), |_| true, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("always") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&policy(5), |_| true, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err("transient")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_with_backoff(&policy(5), |e| *e != "terminal", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("terminal") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
