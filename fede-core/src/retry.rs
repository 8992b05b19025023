//! Bounded retry policy shared by outbound network calls.
//!
//! Every attempt runs under its own timeout; a timed-out attempt counts as a
//! failed attempt. Delays double from `base_delay` with jitter, capped at
//! `max_delay`.

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

/// Outcome of a single attempt that did not succeed.
#[derive(Debug)]
pub enum AttemptError<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: std::fmt::Display> std::fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Failed(e) => write!(f, "{}", e),
            AttemptError::TimedOut(d) => write!(f, "timed out after {} ms", d.as_millis()),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay: Duration, max_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            attempt_timeout,
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Run `op` until it succeeds, `retryable` rejects its error, or the retry
    /// budget is spent. Returns the last error on failure.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, mut retryable: P) -> Result<T, AttemptError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
    {
        // Doubling from `base_delay`: 2^n * (base / 2).
        let base_ms = (self.base_delay.as_millis() as u64).max(2);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(base_ms / 2)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries);

        let timeout = self.attempt_timeout;
        RetryIf::spawn(
            strategy,
            || {
                let fut = op();
                async move {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(Ok(v)) => Ok(v),
                        Ok(Err(e)) => Err(AttemptError::Failed(e)),
                        Err(_) => Err(AttemptError::TimedOut(timeout)),
                    }
                }
            },
            |e: &AttemptError<E>| match e {
                AttemptError::TimedOut(_) => true,
                AttemptError::Failed(inner) => retryable(inner),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, AttemptError<String>> = fast_policy(3)
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err("flaky".to_string())
                        } else {
                            Ok(7)
                        }
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let policy = fast_policy(2);
        let result: Result<(), AttemptError<&str>> = policy
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("down") }
                },
                |_| true,
            )
            .await;
        assert!(matches!(result, Err(AttemptError::Failed("down"))));
        assert_eq!(calls.load(Ordering::SeqCst), policy.max_attempts());
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), AttemptError<&str>> = fast_policy(5)
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("bad request") }
                },
                |_| false,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempt_times_out() {
        let policy = RetryPolicy::new(
            1,
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_millis(20),
        );
        let result: Result<(), AttemptError<&str>> = policy
            .run(
                || async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                },
                |_| true,
            )
            .await;
        assert!(matches!(result, Err(AttemptError::TimedOut(_))));
    }
}
