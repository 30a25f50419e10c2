//! Bounded retry around a circuit breaker.
//!
//! Every attempt takes its own breaker permit, so a breaker that opens part
//! way through a retry sequence stops the remaining attempts immediately.

use std::future::Future;
use std::time::Duration;

use crate::breaker::CircuitBreaker;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
    /// Bound on a single attempt.
    pub call_timeout: Duration,
}

/// Result of one attempt against a dependency.
pub enum Outcome<T> {
    /// The dependency answered normally.
    Success(T),
    /// The dependency answered but reported its own failure (e.g. a 5xx that
    /// is passed through). Counts against the breaker; never retried.
    Unhealthy(T),
    /// Transport-level failure; counts against the breaker and may be retried.
    Transient(String),
    /// The answer could not be used; counts against the breaker, not retried.
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("circuit open")]
    CircuitOpen,

    #[error("call timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unusable response: {0}")]
    Fatal(String),
}

/// Run `op` through `breaker`, retrying transient failures and timeouts when
/// `retryable` is set.
pub async fn call<T, F, Fut>(
    breaker: &std::sync::Arc<CircuitBreaker>,
    policy: &RetryPolicy,
    retryable: bool,
    mut op: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<T>>,
{
    let attempts = if retryable {
        policy.max_retries.saturating_add(1)
    } else {
        1
    };
    let mut last_error = CallError::CircuitOpen;

    for attempt in 0..attempts {
        if attempt > 0 && !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff).await;
        }

        let Ok(permit) = breaker.try_acquire() else {
            tracing::debug!(dependency = breaker.name(), attempt, "rejected by open circuit");
            return Err(if attempt == 0 {
                CallError::CircuitOpen
            } else {
                last_error
            });
        };

        match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(Outcome::Success(value)) => {
                permit.success();
                return Ok(value);
            }
            Ok(Outcome::Unhealthy(value)) => {
                permit.failure();
                return Ok(value);
            }
            Ok(Outcome::Fatal(reason)) => {
                permit.failure();
                return Err(CallError::Fatal(reason));
            }
            Ok(Outcome::Transient(reason)) => {
                permit.failure();
                tracing::warn!(dependency = breaker.name(), attempt, error = %reason, "call failed");
                last_error = CallError::Transport(reason);
            }
            Err(_) => {
                permit.failure();
                tracing::warn!(
                    dependency = breaker.name(),
                    attempt,
                    timeout_ms = policy.call_timeout.as_millis() as u64,
                    "call timed out"
                );
                last_error = CallError::Timeout;
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "resilience-test",
            BreakerConfig {
                failure_threshold: threshold,
                failure_rate: 1.1,
                window_size: 10,
                minimum_calls: 10,
                cooldown: Duration::from_secs(60),
            },
        ))
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::ZERO,
            call_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures_then_succeeds() {
        let cb = breaker(10);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = call(&cb, &policy(2), true, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Outcome::Transient("connection refused".to_string())
            } else {
                Outcome::Success(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let cb = breaker(10);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = call(&cb, &policy(2), true, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Outcome::Transient("refused".to_string())
        })
        .await;
        assert_eq!(result, Err(CallError::Transport("refused".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_makes_single_attempt() {
        let cb = breaker(10);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let _: Result<(), _> = call(&cb, &policy(5), false, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Outcome::Transient("refused".to_string())
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let cb = breaker(10);
        let result: Result<(), _> = call(&cb, &policy(0), true, || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Outcome::Success(())
        })
        .await;
        assert_eq!(result, Err(CallError::Timeout));
    }

    #[tokio::test]
    async fn test_open_circuit_stops_retries() {
        let cb = breaker(2);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = call(&cb, &policy(5), true, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Outcome::Transient("refused".to_string())
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(result, Err(CallError::Transport("refused".to_string())));

        let result: Result<(), _> =
            call(&cb, &policy(5), true, || async { Outcome::Success(()) }).await;
        assert_eq!(result, Err(CallError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_answer_returned_but_counted() {
        let cb = breaker(1);
        let result = call(&cb, &policy(3), true, || async { Outcome::Unhealthy(502) }).await;
        assert_eq!(result, Ok(502));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_extreme_retry_budget_still_attempts() {
        let cb = breaker(10);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = call(&cb, &policy(u32::MAX), true, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Outcome::Success("ok")
        })
        .await;
        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
