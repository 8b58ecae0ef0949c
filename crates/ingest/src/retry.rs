//! Bounded exponential retry around a single logical attempt

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that know whether another attempt could help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Why a retried operation gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The error was retryable but the attempt budget ran out.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The error classification said retrying cannot help.
    #[error("{0}")]
    Permanent(E),

    /// Shutdown arrived during a backoff wait.
    #[error("cancelled while waiting to retry")]
    Cancelled,
}

/// Bounded exponential backoff policy.
///
/// Attempt `k` (1-based) is followed, on retryable failure, by a wait of
/// `base_delay * 2^(k-1)` before attempt `k + 1`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Backoff after the given 1-based attempt number.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << (attempt - 1).min(16))
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt
    /// budget is exhausted. `on_retry` is called before each backoff
    /// wait with the attempt number that just failed. Cancellation
    /// aborts the wait immediately.
    pub async fn run<T, E, F, Fut, N>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: N,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        N: FnMut(u32, &E),
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(RetryError::Permanent(err)),
                Err(err) => {
                    if attempt >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    on_retry(attempt, &err);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(self.backoff(attempt)) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();

        let result: Result<u32, _> = policy()
            .run(
                &cancel,
                || {
                    counted.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, TestError>(7) }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let retries = Arc::new(AtomicU32::new(0));
        let retries_seen = retries.clone();

        let result = policy()
            .run(
                &cancel,
                || {
                    let n = counted.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(TestError { retryable: true })
                        } else {
                            Ok(n)
                        }
                    }
                },
                move |_, _| {
                    retries_seen.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();

        let result: Result<(), _> = policy()
            .run(
                &cancel,
                || {
                    counted.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError { retryable: false }) }
                },
                |_, _| {},
            )
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempt_budget() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();

        let result: Result<(), _> = policy()
            .run(
                &cancel,
                || {
                    counted.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError { retryable: true }) }
                },
                |_, _| {},
            )
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {:?}", other.err().map(|e| e.to_string())),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_wakes_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(3, Duration::from_secs(60));

        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<(), _> = policy
            .run(
                &cancel,
                || async { Err(TestError { retryable: true }) },
                |_, _| {},
            )
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
    }
}
