//! 실행 설정.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use trader_core::policy;
use trader_exchange::{LimitFallbackConfig, RetryConfig};

/// 진입/추가 진입/청산 주문 방식.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderStyle {
    /// 시장가
    #[default]
    Market,
    /// 지정가 시도 후 시장가 폴백
    LimitWithFallback,
}

impl OrderStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStyle::Market => "market",
            OrderStyle::LimitWithFallback => "limit",
        }
    }
}

impl fmt::Display for OrderStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStyle {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "market" => Ok(OrderStyle::Market),
            "limit" | "limit_with_fallback" => Ok(OrderStyle::LimitWithFallback),
            _ => Err(format!("Invalid order style: {}", s)),
        }
    }
}

/// 실행 계층 설정.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// 주문 방식
    pub entry_order: OrderStyle,
    /// 주문 모니터 폴링 주기
    pub monitor_interval: Duration,
    /// 지정가 재시도 설정
    pub limit: LimitFallbackConfig,
    /// 체결 조회 재시도 설정 (거래소 체결 반영 지연 대응)
    pub fill_retry: RetryConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            entry_order: OrderStyle::Market,
            monitor_interval: policy::MONITOR_POLL_INTERVAL,
            limit: LimitFallbackConfig::default(),
            fill_retry: RetryConfig::fast(),
        }
    }
}

impl ExecutionConfig {
    /// 환경변수에서 설정 로드.
    ///
    /// - `EXECUTION_ORDER_STYLE`: `market` | `limit` (기본 `market`)
    /// - `MONITOR_POLL_INTERVAL_SECS`: 모니터 폴링 주기 (기본 5)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            entry_order: env_parse("EXECUTION_ORDER_STYLE", defaults.entry_order),
            monitor_interval: std::env::var("MONITOR_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.monitor_interval),
            ..defaults
        }
    }

    /// 폴링 주기 변경.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// 주문 방식 변경.
    pub fn with_entry_order(mut self, style: OrderStyle) -> Self {
        self.entry_order = style;
        self
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
