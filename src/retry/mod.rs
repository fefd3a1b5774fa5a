//! Classified-error retry with exponential backoff and identity rotation.
//!
//! Every remote operation goes through [`RetryExecutor::execute`]. The
//! operation receives the session to use; it owns any connection it opens and
//! must close it before returning, on success and on error alike.

mod circuit;

pub use circuit::BatchCircuitBreaker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorClass, ScrapeError, ScrapeResult};
use crate::session::{ExecutionSession, SessionManager};

/// Base unit of the exponential backoff.
pub const BACKOFF_BASE: Duration = Duration::from_millis(1000);
/// Upper bound (exclusive) of the random jitter added to each delay.
pub const MAX_JITTER_MS: u64 = 1000;

/// Attempt budget and timeout for one class of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Applied by the operation around its own page work.
    #[serde(rename = "timeout_secs", with = "secs")]
    pub timeout: Duration,
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl RetryPolicy {
    /// Search-page loads: 3 attempts, 60 seconds.
    pub fn search() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(60),
        }
    }

    /// Single detail-page loads: 2 attempts, 45 seconds.
    pub fn detail() -> Self {
        Self {
            max_attempts: 2,
            timeout: Duration::from_secs(45),
        }
    }
}

/// Deterministic part of the delay before retry number `attempt` (1-based):
/// `2^attempt * 1000ms`.
pub fn backoff_base(attempt: u32) -> Duration {
    BACKOFF_BASE * 2u32.saturating_pow(attempt)
}

/// Backoff with uniform jitter in `[0, 1000ms)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let jitter = rand::rng().random_range(0..MAX_JITTER_MS);
    backoff_base(attempt) + Duration::from_millis(jitter)
}

/// Record of one failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    pub operation: String,
    /// 0-based attempt index.
    pub attempt: u32,
    pub class: ErrorClass,
    /// Delay slept before the next attempt; `None` when no retry followed.
    pub delay: Option<Duration>,
}

/// Result of an execution together with its failed attempts.
#[derive(Debug)]
pub struct Traced<T> {
    pub result: ScrapeResult<T>,
    pub attempts: Vec<RetryAttempt>,
}

/// Higher-order wrapper applying the retry policy to remote operations.
#[derive(Clone)]
pub struct RetryExecutor {
    sessions: Arc<SessionManager>,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(sessions: Arc<SessionManager>, cancel: CancellationToken) -> Self {
        Self { sessions, cancel }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `op` under `policy`, returning its value or the last error.
    pub async fn execute<T, F, Fut>(&self, operation: &str, policy: &RetryPolicy, op: F) -> ScrapeResult<T>
    where
        F: FnMut(Arc<ExecutionSession>) -> Fut,
        Fut: Future<Output = ScrapeResult<T>>,
    {
        self.execute_traced(operation, policy, op).await.result
    }

    /// Like [`execute`](Self::execute), also returning each failed attempt.
    pub async fn execute_traced<T, F, Fut>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Traced<T>
    where
        F: FnMut(Arc<ExecutionSession>) -> Fut,
        Fut: Future<Output = ScrapeResult<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts = Vec::new();
        let mut attempt = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Traced {
                    result: Err(ScrapeError::Cancelled),
                    attempts,
                };
            }

            let session = self.sessions.acquire().await;
            debug!(
                "{}: attempt {}/{} on session {} (zone {})",
                operation,
                attempt + 1,
                max_attempts,
                session.generation,
                session.zone
            );

            let error = match op(session).await {
                Ok(value) => {
                    return Traced {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(e) => e,
            };

            let class = error.class();
            let exhausted = attempt + 1 >= max_attempts;
            if class == ErrorClass::Fatal || exhausted {
                if exhausted && class == ErrorClass::Retryable {
                    warn!(
                        "{}: giving up after {} attempts: {}",
                        operation, max_attempts, error
                    );
                }
                attempts.push(RetryAttempt {
                    operation: operation.to_string(),
                    attempt,
                    class,
                    delay: None,
                });
                return Traced {
                    result: Err(error),
                    attempts,
                };
            }

            self.sessions.rotate().await;
            let delay = backoff_delay(attempt + 1);
            warn!(
                "{}: attempt {} failed ({}), retrying in {:?}",
                operation,
                attempt + 1,
                error,
                delay
            );
            attempts.push(RetryAttempt {
                operation: operation.to_string(),
                attempt,
                class,
                delay: Some(delay),
            });

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Traced { result: Err(ScrapeError::Cancelled), attempts };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::session::{NoFingerprint, SessionLimits};

    fn executor() -> RetryExecutor {
        let sessions = SessionManager::new(
            vec!["a".into(), "b".into(), "c".into()],
            SessionLimits::default(),
            Box::new(NoFingerprint),
        )
        .unwrap();
        RetryExecutor::new(Arc::new(sessions), CancellationToken::new())
    }

    #[test]
    fn test_backoff_sequence() {
        assert_eq!(backoff_base(1), Duration::from_millis(2000));
        assert_eq!(backoff_base(2), Duration::from_millis(4000));
        assert_eq!(backoff_base(3), Duration::from_millis(8000));
        for attempt in 1..=3 {
            let delay = backoff_delay(attempt);
            assert!(delay >= backoff_base(attempt));
            assert!(delay < backoff_base(attempt) + Duration::from_millis(MAX_JITTER_MS));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let executor = executor();
        let traced = executor
            .execute_traced("op", &RetryPolicy::search(), |_| async { Ok(7) })
            .await;
        assert_eq!(traced.result.unwrap(), 7);
        assert!(traced.attempts.is_empty());
        assert_eq!(executor.sessions().issued_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failures_rotate_and_back_off() {
        let executor = executor();
        let calls = AtomicU32::new(0);
        let traced = executor
            .execute_traced("search", &RetryPolicy::search(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ScrapeError::http(503, "https://example.com"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(traced.result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(traced.attempts.len(), 2);
        // One rotation per retryable failure
        assert_eq!(executor.sessions().issued_count(), 3);

        let first = traced.attempts[0].delay.unwrap();
        let second = traced.attempts[1].delay.unwrap();
        assert!(first >= Duration::from_millis(2000) && first < Duration::from_millis(3000));
        assert!(second >= Duration::from_millis(4000) && second < Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_no_delay_no_rotation() {
        let executor = executor();
        let calls = AtomicU32::new(0);
        let traced: Traced<()> = executor
            .execute_traced("detail", &RetryPolicy::detail(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ScrapeError::http(404, "https://example.com/x")) }
            })
            .await;

        assert!(matches!(traced.result, Err(ScrapeError::Http { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(traced.attempts.len(), 1);
        assert_eq!(traced.attempts[0].class, ErrorClass::Fatal);
        assert_eq!(traced.attempts[0].delay, None);
        assert_eq!(executor.sessions().issued_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_return_last_error() {
        let executor = executor();
        let calls = AtomicU32::new(0);
        let result: ScrapeResult<()> = executor
            .execute("detail", &RetryPolicy::detail(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(ScrapeError::Timeout(Duration::from_secs(45), format!("try {}", n))) }
            })
            .await;

        match result {
            Err(ScrapeError::Timeout(_, msg)) => assert_eq!(msg, "try 1"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Only the first failure had an attempt remaining
        assert_eq!(executor.sessions().issued_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_gets_fresh_session() {
        let executor = executor();
        let mut seen = Vec::new();
        let _: ScrapeResult<()> = executor
            .execute("op", &RetryPolicy::search(), |session| {
                seen.push(session.generation);
                async { Err(ScrapeError::navigation("https://example.com", "reset")) }
            })
            .await;
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let executor = executor();
        executor.cancel_token().cancel();
        let result = executor
            .execute("op", &RetryPolicy::search(), |_| async { Ok(1) })
            .await;
        assert!(matches!(result, Err(ScrapeError::Cancelled)));
    }
}
