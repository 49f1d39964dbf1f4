use crate::config::RateLimitConfig;
use crate::utils::error::{IngestError, Result};
use governor::{DefaultDirectRateLimiter, Quota};
use std::num::NonZeroU32;

/// Request pacing shared by every fetch worker of a run.
pub struct RateLimiter {
    inner: Option<DefaultDirectRateLimiter>,
}

fn non_zero(field: &str, value: u32) -> Result<NonZeroU32> {
    NonZeroU32::new(value).ok_or_else(|| IngestError::InvalidConfigValueError {
        field: field.to_string(),
        value: value.to_string(),
        reason: "Value must be at least 1".to_string(),
    })
}

impl RateLimiter {
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        let burst = non_zero("rate_limit.burst", config.burst.unwrap_or(1))?;

        let quota = match (config.requests_per_second, config.requests_per_minute) {
            (Some(_), Some(_)) => {
                return Err(IngestError::ConfigValidationError {
                    field: "rate_limit".to_string(),
                    message: "set either requests_per_second or requests_per_minute, not both"
                        .to_string(),
                })
            }
            (Some(rps), None) => {
                Some(Quota::per_second(non_zero("rate_limit.requests_per_second", rps)?))
            }
            (None, Some(rpm)) => {
                Some(Quota::per_minute(non_zero("rate_limit.requests_per_minute", rpm)?))
            }
            (None, None) => None,
        };

        match quota {
            Some(quota) => {
                tracing::debug!("Rate limiting with {:?}, burst {}", quota, burst);
                Ok(Self {
                    inner: Some(governor::RateLimiter::direct(quota.allow_burst(burst))),
                })
            }
            None => Ok(Self::unlimited()),
        }
    }

    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    pub fn is_limited(&self) -> bool {
        self.inner.is_some()
    }

    /// Waits until the quota allows one more request.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limited", &self.is_limited())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_unlimited_does_not_wait() {
        let limiter = RateLimiter::from_config(&RateLimitConfig::default()).unwrap();
        assert!(!limiter.is_limited());

        let start = Instant::now();
        for _ in 0..50 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_per_second_quota_paces_requests() {
        let limiter = RateLimiter::from_config(&RateLimitConfig {
            requests_per_second: Some(10),
            requests_per_minute: None,
            burst: Some(1),
        })
        .unwrap();

        let start = Instant::now();
        // First permit is immediate, the next four are spaced ~100ms apart
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_burst_allows_immediate_requests() {
        let limiter = RateLimiter::from_config(&RateLimitConfig {
            requests_per_second: Some(1),
            requests_per_minute: None,
            burst: Some(3),
        })
        .unwrap();

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        let result = RateLimiter::from_config(&RateLimitConfig {
            requests_per_second: Some(0),
            requests_per_minute: None,
            burst: None,
        });
        assert!(matches!(
            result,
            Err(IngestError::InvalidConfigValueError { .. })
        ));
    }

    #[test]
    fn test_both_units_are_rejected() {
        let result = RateLimiter::from_config(&RateLimitConfig {
            requests_per_second: Some(1),
            requests_per_minute: Some(60),
            burst: None,
        });
        assert!(result.is_err());
    }
}
