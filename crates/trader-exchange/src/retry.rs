//! 거래소 API 재시도 유틸리티.
//!
//! 네트워크 오류, Rate Limit, 체결 내역 반영 지연 같은 일시적인 오류에 대해
//! 제한된 횟수만큼 재시도합니다. 어떤 호출을 재시도할지는 호출 지점에서 정합니다.
//!
//! # 예시
//!
//! ```rust,ignore
//! use trader_exchange::retry::{RetryConfig, with_retry};
//!
//! let fill = with_retry(&RetryConfig::fast(), || async {
//!     exchange.query_fill(instrument, &order_id).await
//! }).await?;
//! ```

use std::{future::Future, time::Duration};

use tracing::{debug, warn};
use trader_core::domain::ProviderError;

/// 재시도 설정.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 최대 재시도 횟수 (초기 시도 제외).
    pub max_retries: u32,
    /// 기본 대기 시간 (에러에 지정된 대기 시간이 없을 때 사용).
    pub base_delay: Duration,
    /// 최대 대기 시간.
    pub max_delay: Duration,
    /// 지수 백오프 사용 여부.
    pub use_exponential_backoff: bool,
    /// 백오프 배수.
    pub backoff_multiplier: f64,
    /// 지터(±25%) 추가 여부.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            use_exponential_backoff: true,
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// 빠른 재시도 (체결 내역 조회용).
    pub fn fast() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(3),
            use_exponential_backoff: true,
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// 재시도 없음 (단일 시도).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    fn calculate_delay(&self, attempt: u32, error: &ProviderError) -> Duration {
        // 거래소가 지정한 대기 시간 우선
        let base = error
            .retry_delay_ms()
            .map(Duration::from_millis)
            .unwrap_or(self.base_delay);

        let delay = if self.use_exponential_backoff && attempt > 0 {
            let multiplier = self.backoff_multiplier.powi(attempt as i32);
            Duration::from_secs_f64(base.as_secs_f64() * multiplier)
        } else {
            base
        };
        let delay = delay.min(self.max_delay);

        if self.add_jitter {
            apply_jitter(delay, rand_simple())
        } else {
            delay
        }
    }
}

/// `unit`(0.0 ~ 1.0)을 ±25% 범위로 옮겨 대기 시간에 더함.
fn apply_jitter(delay: Duration, unit: f64) -> Duration {
    let jitter_range = delay.as_millis() as f64 * 0.25;
    let jitter = (unit * 2.0 - 1.0) * jitter_range;
    Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64)
}

/// 시스템 시간 기반 난수 (0.0 ~ 1.0).
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    unit_from_nanos(nanos)
}

/// 1초 미만 나노초(0 ~ 999_999_999)를 0.0 ~ 1.0 으로 정규화.
fn unit_from_nanos(nanos: u32) -> f64 {
    f64::from(nanos) / 1_000_000_000.0
}

/// 재시도가 포함된 비동기 작업 실행.
///
/// `ProviderError::is_retryable()` 이 아닌 에러는 즉시 반환합니다.
/// 모든 재시도가 실패하면 마지막 에러를 반환합니다.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    let mut total_delay = Duration::ZERO;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        attempts = attempt + 1,
                        total_delay_ms = total_delay.as_millis(),
                        "재시도 후 성공"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_retryable() {
                    debug!(error = %e, "재시도 불가능한 에러, 즉시 실패 반환");
                    return Err(e);
                }

                if attempt >= config.max_retries {
                    warn!(
                        error = %e,
                        attempts = attempt + 1,
                        max_retries = config.max_retries,
                        "최대 재시도 횟수 초과"
                    );
                    return Err(e);
                }

                let delay = config.calculate_delay(attempt, &e);
                total_delay += delay;

                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis(),
                    "재시도 대기 중"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    fn quick() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            use_exponential_backoff: false,
            add_jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn immediate_success() {
        let result = with_retry(&RetryConfig::default(), || async { Ok::<_, ProviderError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_until_fills_appear() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&quick(), || {
            let counter = counter_clone.clone();
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(ProviderError::NotFound("fills".to_string()))
                } else {
                    Ok("filled")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "filled");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn parse_errors_are_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&quick(), || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(ProviderError::Parse("bad body".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&quick(), || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(ProviderError::Network("항상 실패".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Network(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exchange_delay_takes_precedence() {
        let config = RetryConfig {
            add_jitter: false,
            use_exponential_backoff: false,
            ..Default::default()
        };
        let err = ProviderError::RateLimited {
            retry_after_ms: Some(1500),
        };
        assert_eq!(config.calculate_delay(0, &err), Duration::from_millis(1500));
        assert_eq!(RetryConfig::no_retry().max_retries, 0);
    }

    #[test]
    fn jitter_spans_both_directions() {
        assert_eq!(unit_from_nanos(0), 0.0);
        assert_eq!(unit_from_nanos(500_000_000), 0.5);
        assert!(unit_from_nanos(999_999_999) > 0.99);

        let delay = Duration::from_millis(1000);
        assert_eq!(apply_jitter(delay, 0.0), Duration::from_millis(750));
        assert_eq!(apply_jitter(delay, 0.5), Duration::from_millis(1000));
        assert_eq!(
            apply_jitter(delay, unit_from_nanos(999_999_999)),
            Duration::from_millis(1249)
        );
    }
}
