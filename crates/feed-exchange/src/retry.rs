//! 지수 백오프 재시도.
//!
//! 일시적 I/O 오류(타임아웃, 연결 오류, 5xx, rate limit)만 재시도하며,
//! 모든 시도에는 개별 타임아웃이 적용됩니다. rate limit 응답은 즉시
//! 재시도하지 않고 서버가 요구한 시간 이상 대기합니다.

use std::future::Future;
use std::time::Duration;

use feed_core::ExchangeConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{ExchangeError, ExchangeResult};

/// 재시도 정책.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 최대 시도 횟수 (첫 시도 포함)
    pub max_attempts: u32,
    /// 첫 재시도 대기 (밀리초)
    pub initial_delay_ms: u64,
    /// 대기 상한 (밀리초)
    pub max_delay_ms: u64,
    /// 지수 배수
    pub multiplier: f64,
    /// 지터 적용 여부 (최대 +25%)
    pub jitter: bool,
    /// 시도당 타임아웃 (밀리초)
    pub attempt_timeout_ms: u64,
    /// Retry-After가 없는 rate limit 응답의 대기 (밀리초)
    pub rate_limit_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: 10_000,
            rate_limit_delay_ms: 60_000,
        }
    }
}

impl From<&ExchangeConfig> for RetryConfig {
    fn from(config: &ExchangeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay_ms: config.retry_initial_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
            multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: config.request_timeout_secs * 1000,
            rate_limit_delay_ms: config.rate_limit_delay_ms,
        }
    }
}

impl RetryConfig {
    /// `attempt`번째 실패(1부터) 이후의 백오프 대기 시간.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(30) as i32);
        let base = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let with_jitter = if self.jitter {
            base * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            base
        };
        Duration::from_millis(with_jitter.min(self.max_delay_ms as f64) as u64)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }
}

/// 재시도 정책에 따라 비동기 작업을 실행합니다.
///
/// 재시도 불가능한 에러는 즉시 반환하고, 시도를 모두 소진하면
/// [`ExchangeError::FetchUnavailable`]을 반환합니다.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> ExchangeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExchangeResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let result = match tokio::time::timeout(config.attempt_timeout(), f()).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(format!(
                "{} attempt {} exceeded {:?}",
                operation,
                attempt,
                config.attempt_timeout()
            ))),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Retry succeeded");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        last_error = err.to_string();
        if attempt == max_attempts {
            break;
        }

        let backoff = config.delay_for_attempt(attempt);
        let delay = err
            .cooperative_delay(config.rate_limit_delay())
            .map_or(backoff, |cooperative| cooperative.max(backoff));

        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }

    Err(ExchangeError::FetchUnavailable {
        attempts: max_attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 40,
            multiplier: 2.0,
            jitter: false,
            attempt_timeout_ms: 1_000,
            rate_limit_delay_ms: 500,
        }
    }

    #[test]
    fn test_delay_is_capped_exponential() {
        let config = fast_config(5);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(40));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let config = RetryConfig {
            jitter: true,
            ..fast_config(5)
        };
        for attempt in 1..10 {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_millis(40));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&fast_config(3), "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExchangeError::ServerError {
                        status: 502,
                        message: "bad gateway".into(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: ExchangeResult<()> = with_retry(&fast_config(5), "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::ApiError { code: -1121, message: "Invalid symbol".into() }) }
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::ApiError { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_yields_fetch_unavailable() {
        let result: ExchangeResult<()> = with_retry(&fast_config(3), "test", || async {
            Err(ExchangeError::Timeout("slow".into()))
        })
        .await;

        match result {
            Err(ExchangeError::FetchUnavailable { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("slow"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_cooperatively() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = tokio::time::Instant::now();

        let result = with_retry(&fast_config(2), "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExchangeError::RateLimited {
                        retry_after: Some(Duration::from_secs(5)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out() {
        let config = RetryConfig {
            attempt_timeout_ms: 100,
            ..fast_config(2)
        };
        let result: ExchangeResult<()> = with_retry(&config, "hang", || async {
            std::future::pending::<ExchangeResult<()>>().await
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::FetchUnavailable { attempts: 2, .. })));
    }
}
