use crate::config::RetryConfig;
use crate::utils::error::{IngestError, Result};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{Jitter, RetryDecision, RetryPolicy as _};
use std::future::Future;
use std::time::{Duration, SystemTime};

/// Exponential backoff for transient fetch errors. Delays come from
/// reqwest-retry's `ExponentialBackoff`; a server `Retry-After` hint wins
/// over the computed delay, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    max_delay: Duration,
    backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(IngestError::InvalidConfigValueError {
                field: "retry.max_attempts".to_string(),
                value: "0".to_string(),
                reason: "Value must be at least 1".to_string(),
            });
        }
        // retry_bounds 會在 min > max 時 panic
        if base_delay > max_delay {
            return Err(IngestError::InvalidConfigValueError {
                field: "retry.base_delay_ms".to_string(),
                value: base_delay.as_millis().to_string(),
                reason: format!("must not exceed retry.max_delay_ms ({})", max_delay.as_millis()),
            });
        }

        let backoff = ExponentialBackoff::builder()
            .retry_bounds(base_delay, max_delay)
            .jitter(Jitter::None)
            .build_with_max_retries(max_attempts - 1);

        Ok(Self {
            max_attempts,
            max_delay,
            backoff,
        })
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    #[cfg(test)]
    pub(crate) fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            max_delay: Duration::ZERO,
            backoff: ExponentialBackoff::builder().build_with_max_retries(0),
        }
    }

    /// Backoff before the next attempt given how many retries already ran,
    /// or `None` once the retry budget is spent.
    pub fn delay_for(&self, past_retries: u32) -> Option<Duration> {
        match self.backoff.should_retry(SystemTime::now(), past_retries) {
            RetryDecision::Retry { execute_after } => Some(
                execute_after
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            ),
            RetryDecision::DoNotRetry => None,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Returns the value and the attempts used.
    ///
    /// Failures after more than one attempt come back as
    /// `RetryExhaustedError` or `RetryAbortedError`, both carrying the
    /// attempt count.
    pub async fn run<T, F, Fut>(&self, url: &str, mut op: F) -> Result<(T, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let error = match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => e,
            };

            if !error.is_retryable() {
                if attempt == 1 {
                    return Err(error);
                }
                return Err(IngestError::RetryAbortedError {
                    url: url.to_string(),
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let Some(backoff) = self.delay_for(attempt - 1) else {
                if attempt == 1 {
                    return Err(error);
                }
                return Err(IngestError::RetryExhaustedError {
                    url: url.to_string(),
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            };

            let delay = error
                .retry_after()
                .map(|hint| hint.min(self.max_delay))
                .unwrap_or(backoff);
            tracing::warn!(
                "⚠️ Attempt {}/{} for {} failed: {} (retrying in {:?})",
                attempt,
                self.max_attempts,
                url,
                error,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
        .unwrap()
    }

    fn status_error(status: u16) -> IngestError {
        IngestError::HttpStatusError {
            url: "http://example.com".to_string(),
            status,
            retry_after: None,
            body: String::new(),
            transient: status == 429 || status >= 500,
        }
    }

    fn assert_near(actual: Option<Duration>, expected_ms: u64) {
        let actual = actual.expect("expected a retry delay");
        let expected = Duration::from_millis(expected_ms);
        assert!(
            actual <= expected && actual + Duration::from_millis(50) >= expected,
            "delay {:?} not near {:?}",
            actual,
            expected
        );
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000))
            .unwrap();
        assert_near(policy.delay_for(0), 100);
        assert_near(policy.delay_for(1), 200);
        assert_near(policy.delay_for(2), 400);
        assert_near(policy.delay_for(5), 1000);
        // 10 attempts = 9 retries
        assert_eq!(policy.delay_for(9), None);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (value, attempts) = policy(3)
            .run("http://example.com", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(status_error(503))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(u32, u32)> = policy(3)
            .run("http://example.com", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(status_error(503))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(IngestError::RetryExhaustedError { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetryExhaustedError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(u32, u32)> = policy(5)
            .run("http://example.com", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(status_error(404))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err();
        assert!(matches!(err, IngestError::HttpStatusError { status: 404, .. }));
        assert_eq!(err.attempts(), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_after_retry_keeps_attempt_count() {
        // 503 然後 404
        let result: Result<(u32, u32)> = policy(5)
            .run("http://example.com", |attempt| async move {
                if attempt == 1 {
                    Err(status_error(503))
                } else {
                    Err(status_error(404))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 2);
        assert!(!err.is_retryable());
        match err {
            IngestError::RetryAbortedError { attempts, source, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, IngestError::HttpStatusError { status: 404, .. }));
            }
            other => panic!("expected RetryAbortedError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_attempt_returns_original_error() {
        let result: Result<(u32, u32)> = RetryPolicy::no_retry()
            .run("http://example.com", |_| async { Err(status_error(503)) })
            .await;

        assert!(matches!(
            result,
            Err(IngestError::HttpStatusError { status: 503, .. })
        ));
    }

    #[test]
    fn test_invalid_bounds_are_rejected() {
        let zero_attempts = RetryConfig {
            max_attempts: 0,
            base_delay_ms: 10,
            max_delay_ms: 100,
        };
        assert!(RetryPolicy::from_config(&zero_attempts).is_err());

        let inverted = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 100,
        };
        assert!(RetryPolicy::from_config(&inverted).is_err());
    }
}
