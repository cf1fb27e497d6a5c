//! Run-with-retry wrapper shared by chunk uploads and the registration call.

use crate::error::RemoteError;
use crate::services::backoff::BackoffPolicy;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// One failed attempt.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    /// Delay slept before the next attempt; `None` when no retry followed.
    pub delay: Option<Duration>,
    pub error: String,
}

/// Diagnostics for one `execute_with_retry` call. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub history: Vec<RetryAttempt>,
    pub last_error: Option<String>,
    pub in_progress: bool,
}

impl RetryState {
    pub fn failed_attempts(&self) -> usize {
        self.history.len()
    }
}

#[derive(Debug)]
pub struct RetryError<E> {
    pub last_error: E,
    pub state: RetryState,
    /// `false` when the loop stopped early on a non-retryable error.
    pub exhausted: bool,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exhausted {
            write!(
                f,
                "retries exhausted after {} attempts: {}",
                self.state.attempts, self.last_error
            )
        } else {
            write!(
                f,
                "non-retryable failure on attempt {}: {}",
                self.state.attempts, self.last_error
            )
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: BackoffPolicy,
}

impl RetryExecutor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Runs `operation` up to `max_retries + 1` times.
    ///
    /// `on_retry` is called once per failed attempt that will be retried, with
    /// the attempt number, the delay about to be slept and the error text.
    pub async fn execute_with_retry<T, E, F, Fut, R>(
        &self,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<(T, RetryState), RetryError<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(&RetryAttempt),
    {
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut state = RetryState {
            in_progress: true,
            ..RetryState::default()
        };

        loop {
            state.attempts += 1;
            let attempt = state.attempts;

            match operation(attempt).await {
                Ok(value) => {
                    state.in_progress = false;
                    return Ok((value, state));
                }
                Err(err) => {
                    let message = err.to_string();
                    state.last_error = Some(message.clone());

                    let retryable = err.is_retryable();
                    if !retryable || attempt >= max_attempts {
                        state.history.push(RetryAttempt {
                            timestamp: Utc::now(),
                            attempt,
                            delay: None,
                            error: message,
                        });
                        state.in_progress = false;
                        tracing::warn!(
                            "Giving up after {} attempt(s) (retryable={}): {}",
                            attempt,
                            retryable,
                            err
                        );
                        return Err(RetryError {
                            last_error: err,
                            state,
                            exhausted: retryable,
                        });
                    }

                    let delay = self.policy.delay_for(attempt);
                    let record = RetryAttempt {
                        timestamp: Utc::now(),
                        attempt,
                        delay: Some(delay),
                        error: message,
                    };
                    tracing::debug!(
                        "Attempt {} failed, retrying in {:?}: {}",
                        attempt,
                        delay,
                        record.error
                    );
                    on_retry(&record);
                    state.history.push(record);

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RemoteError, RemoteErrorKind};
    use crate::services::backoff::BackoffStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            strategy: BackoffStrategy::Linear,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            max_retries,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast_policy(5));
        let mut seen = Vec::new();

        let (value, state) = executor
            .execute_with_retry(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(RemoteError::network("connection reset"))
                        } else {
                            Ok("etag-3")
                        }
                    }
                },
                |a| seen.push(a.attempt),
            )
            .await
            .unwrap();

        assert_eq!(value, "etag-3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.attempts, 3);
        assert_eq!(state.failed_attempts(), 2);
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(state.history[1].delay, Some(Duration::from_millis(2)));
        assert!(!state.in_progress);
    }

    #[tokio::test]
    async fn test_exhausts_after_max_retries_plus_one() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast_policy(2));

        let err = executor
            .execute_with_retry(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(RemoteError::timeout("deadline")) }
                },
                |_| {},
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.exhausted);
        assert_eq!(err.state.attempts, 3);
        assert_eq!(err.state.history.len(), 3);
        assert!(err.state.history[2].delay.is_none());
        assert!(err.to_string().contains("retries exhausted"));
    }

    #[tokio::test]
    async fn test_stops_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast_policy(5));

        let err = executor
            .execute_with_retry(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(RemoteError::new(RemoteErrorKind::Permission, "denied"))
                    }
                },
                |_| {},
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!err.exhausted);
        assert_eq!(err.last_error.kind, RemoteErrorKind::Permission);
    }
}
