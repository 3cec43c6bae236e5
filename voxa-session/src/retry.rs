//! Reconnect policy and the attempt-with-policy combinator.
//!
//! Policy is decoupled from the connection-specific logic: the combinator
//! owns backoff, the ceiling, and the liveness short-circuit; callers
//! supply the attempt future.

use crate::error::{SessionError, SessionResult};
use std::future::Future;
use std::time::Duration;

/// Explicit retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Hard ceiling on attempts.
    pub max_attempts: u32,
    /// Base backoff delay; doubles with each attempt.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_millis(30_000),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &voxa_common::config::RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: false,
        }
    }

    /// Backoff delay after a failed attempt: `base × 2^(attempt−1)`, capped.
    /// `attempt` is 1-based.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let mut delay_ms = base_ms
            .saturating_mul(2_u64.saturating_pow(exponent))
            .min(max_ms);
        if self.jitter {
            delay_ms += rand_jitter(delay_ms / 10);
        }
        Duration::from_millis(delay_ms)
    }
}

fn rand_jitter(max_ms: u64) -> u64 {
    use rand::Rng;
    if max_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_ms)
    }
}

/// Run `attempt_fn` under `policy`.
///
/// Before every attempt, `still_needed` is consulted: when it reports false
/// the session has already self-healed (or been closed) and the combinator
/// returns `Ok(None)` without connecting, so a retry scheduled during a
/// since-recovered session becomes a no-op.
///
/// Non-retryable errors propagate immediately; exhausting the ceiling
/// yields [`SessionError::RetriesExhausted`].
pub async fn retry_with_policy<T, L, F, Fut>(
    policy: &RetryPolicy,
    mut still_needed: L,
    mut attempt_fn: F,
) -> SessionResult<Option<T>>
where
    L: FnMut() -> bool,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SessionResult<T>>,
{
    let mut last_error: Option<SessionError> = None;

    for attempt in 1..=policy.max_attempts {
        if !still_needed() {
            tracing::debug!(attempt, "Session no longer needs this attempt, skipping");
            return Ok(None);
        }

        match attempt_fn(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Connection recovered after retries");
                }
                return Ok(Some(value));
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                let delay = policy.delay(attempt);
                if attempt < policy.max_attempts {
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                } else {
                    last_error = Some(e);
                }
            }
        }
    }

    Err(SessionError::RetriesExhausted {
        attempts: policy.max_attempts,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(base_ms * 100),
            jitter: false,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = policy(5, 2_000);
        assert_eq!(policy.delay(1).as_millis(), 2_000);
        assert_eq!(policy.delay(2).as_millis(), 4_000);
        assert_eq!(policy.delay(3).as_millis(), 8_000);
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(500));
            previous = delay;
        }
        assert_eq!(policy.delay(40).as_millis(), 500);
    }

    #[test]
    fn jitter_stays_within_a_tenth() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(60_000),
            jitter: true,
        };
        for _ in 0..50 {
            let ms = policy.delay(1).as_millis() as u64;
            assert!((1_000..=1_100).contains(&ms));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fails_then_recovers_with_expected_delays() {
        // Three failures at base 2000ms: waits of ~2000, ~4000, ~8000ms,
        // then the fourth attempt succeeds.
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let started = tokio::time::Instant::now();

        let result = retry_with_policy(&policy(4, 2_000), || true, move |_attempt| {
            let counter = Arc::clone(&counter);
            async move {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= 3 {
                    Err(SessionError::Timeout)
                } else {
                    Ok("connected")
                }
            }
        })
        .await;

        assert_eq!(result.expect("success"), Some("connected"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(2_000 + 4_000 + 8_000));
    }

    #[tokio::test(start_paused = true)]
    async fn no_attempt_beyond_the_ceiling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: SessionResult<Option<()>> =
            retry_with_policy(&policy(3, 10), || true, move |_attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SessionError::Timeout)
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(SessionError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn self_healed_session_skips_the_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: SessionResult<Option<()>> =
            retry_with_policy(&policy(3, 10), || false, move |_attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(result.expect("no-op"), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: SessionResult<Option<()>> =
            retry_with_policy(&policy(5, 10), || true, move |_attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SessionError::Device("permission denied".into()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SessionError::Device(_))));
    }
}
