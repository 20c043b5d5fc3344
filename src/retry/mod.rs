//! Bounded retry for lock-contention failures.
//!
//! The compiler front end reads build-graph state that can be invalidated
//! mid-read when a concurrent write lands. Those reads are optimistic: on a
//! concurrent invalidation the read is simply re-run. This module provides
//! the bounded retry loop for that pattern, parameterized by a classifier
//! that distinguishes transient causes (retry) from fatal ones (fail
//! immediately).
//!
//! Retries are purely about contention, never about compiler correctness: a
//! cause classified as [`FailureClass::Fatal`] short-circuits the remaining
//! attempt budget on the spot.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Default attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base backoff delay; the n-th attempt sleeps `base * n`, capped.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);

/// Upper bound on the backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(200);

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The cause is contention-shaped; the attempt may be re-run.
    Transient,
    /// The cause is real; remaining attempts are pointless.
    Fatal,
}

/// Terminal outcome of a retry loop that never succeeded.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// A non-retriable cause aborted the loop on its first occurrence.
    #[error("non-retriable failure: {0}")]
    Fatal(E),

    /// Every attempt failed with a transient cause; carries the last one.
    #[error("still failing after {attempts} attempts: {cause}")]
    Exhausted {
        /// Attempts that were made.
        attempts: u32,
        /// Cause captured on the final attempt.
        cause: E,
    },

    /// Cancellation was observed between attempts.
    #[error("cancelled between retry attempts")]
    Cancelled,

    /// The loop finished without ever capturing a cause. Only reachable with
    /// a zero attempt budget, which is an invariant violation in the caller.
    #[error("retry loop exhausted without a captured cause")]
    NoAttempts,
}

/// Re-runs a unit of work whose failures may be transient.
#[derive(Debug, Clone, Copy)]
pub struct RetryingInvoker {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryingInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryingInvoker {
    /// Creates an invoker with the given attempt budget and default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Overrides the backoff schedule.
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Attempt budget.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `work` until it succeeds, a fatal cause appears, cancellation is
    /// observed, or the attempt budget runs out.
    ///
    /// Cancellation is polled before each attempt and on both sides of each
    /// backoff sleep. The backoff for attempt `n` is `base * n` capped at the
    /// configured maximum.
    pub async fn retry<T, E, F, Fut, C>(
        &self,
        cancel: &CancellationToken,
        classify: C,
        mut work: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureClass,
    {
        if self.max_attempts == 0 {
            error!("retry invoked with a zero attempt budget");
            return Err(RetryError::NoAttempts);
        }

        let mut last_cause: Option<E> = None;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            match work().await {
                Ok(value) => return Ok(value),
                Err(cause) => match classify(&cause) {
                    FailureClass::Fatal => return Err(RetryError::Fatal(cause)),
                    FailureClass::Transient => {
                        debug!(
                            attempt,
                            max_attempts = self.max_attempts,
                            "transient failure, will retry"
                        );
                        last_cause = Some(cause);
                    }
                },
            }

            if attempt < self.max_attempts {
                if cancel.is_cancelled() {
                    return Err(RetryError::Cancelled);
                }
                let delay = (self.base_delay * attempt).min(self.max_delay);
                tokio::time::sleep(delay).await;
                if cancel.is_cancelled() {
                    return Err(RetryError::Cancelled);
                }
            }
        }

        match last_cause {
            Some(cause) => {
                warn!(
                    attempts = self.max_attempts,
                    "attempt budget exhausted, surfacing last cause"
                );
                Err(RetryError::Exhausted {
                    attempts: self.max_attempts,
                    cause,
                })
            }
            // Unreachable with a positive budget: every failed attempt
            // captures its cause.
            None => {
                error!("retry loop exhausted without a captured cause");
                Err(RetryError::NoAttempts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn transient(_: &&str) -> FailureClass {
        FailureClass::Transient
    }

    #[tokio::test]
    async fn test_success_on_first_attempt_runs_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let outcome: Result<u32, RetryError<&str>> = RetryingInvoker::new(3)
            .retry(&CancellationToken::new(), transient, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            })
            .await;

        assert_eq!(outcome.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_always_failing_work_attempts_exactly_budget() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let outcome: Result<u32, RetryError<&str>> = RetryingInvoker::new(4)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
            .retry(&CancellationToken::new(), transient, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>("graph invalidated")
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        match outcome {
            Err(RetryError::Exhausted { attempts, cause }) => {
                assert_eq!(attempts, 4);
                assert_eq!(cause, "graph invalidated");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_cause_attempts_exactly_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let outcome: Result<u32, RetryError<&str>> = RetryingInvoker::new(5)
            .retry(
                &CancellationToken::new(),
                |_: &&str| FailureClass::Fatal,
                move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<u32, _>("broken input")
                    }
                },
            )
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome, Err(RetryError::Fatal("broken input"))));
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let outcome: Result<u32, RetryError<&str>> = RetryingInvoker::new(3)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
            .retry(&CancellationToken::new(), transient, move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("graph invalidated")
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(outcome.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome: Result<u32, RetryError<&str>> = RetryingInvoker::new(3)
            .retry(&cancel, transient, || async { Ok(1) })
            .await;

        assert!(matches!(outcome, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellation_observed_during_backoff() {
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let canceller = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome: Result<u32, RetryError<&str>> = RetryingInvoker::new(10)
            .with_backoff(Duration::from_millis(50), Duration::from_millis(200))
            .retry(&cancel, transient, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>("graph invalidated")
                }
            })
            .await;

        assert!(matches!(outcome, Err(RetryError::Cancelled)));
        assert!(attempts.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test]
    async fn test_zero_attempt_budget_is_an_invariant_violation() {
        let outcome: Result<u32, RetryError<&str>> = RetryingInvoker::new(0)
            .retry(&CancellationToken::new(), transient, || async { Ok(1) })
            .await;

        assert!(matches!(outcome, Err(RetryError::NoAttempts)));
    }
}
