//! 선물 거래소 추상화.
//!
//! 시장가/지정가 주문, 보호 주문(SLTP) 배치·정정·취소, 체결 조회,
//! 주문 상태 조회, 마크 가격 조회를 거래소 중립적인 인터페이스로 제공합니다.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::records::{SltpOrder, Trader};
use super::types::{Direction, FillSide, Instrument, OrderSide, PlanType};

// =============================================================================
// 응답 타입
// =============================================================================

/// 체결 상세.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillDetail {
    pub price: Decimal,
    pub quantity: Decimal,
    /// 수수료 (거래소 기준 부호, 보통 음수)
    pub fee: Decimal,
    /// 실현 손익
    pub profit: Decimal,
    pub side: FillSide,
    pub filled_at: DateTime<Utc>,
}

/// 일반 주문 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl OrderState {
    /// 거래소 문자열 해석.
    pub fn from_exchange(raw: &str) -> Option<Self> {
        match raw {
            "new" | "init" => Some(OrderState::New),
            "partially_filled" => Some(OrderState::PartiallyFilled),
            "filled" | "full_fill" => Some(OrderState::Filled),
            "canceled" | "cancelled" => Some(OrderState::Canceled),
            _ => None,
        }
    }
}

/// 주문 상태 + 누적 체결 수량.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub state: OrderState,
    pub filled_quantity: Decimal,
}

/// 보호 주문 정정 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectiveOrderStatus {
    /// 정정 성공 (주문이 아직 살아있음)
    Confirmed,
    /// 거래소에 주문이 없음 (이미 발동됨)
    Triggered,
}

// =============================================================================
// 에러 타입
// =============================================================================

/// 거래소 에러.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 네트워크 에러
    #[error("네트워크 에러: {0}")]
    Network(String),

    /// 인증 실패
    #[error("인증 실패: {0}")]
    Authentication(String),

    /// 거래소 애플리케이션 에러 (응답 code 포함)
    #[error("API 에러 [{code}]: {message}")]
    Api { code: String, message: String },

    /// 요청 한도 초과
    #[error("요청 한도 초과 (재시도 대기: {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// 조회 대상이 아직 없음 (예: 체결 내역 반영 지연)
    #[error("조회 결과 없음: {0}")]
    NotFound(String),

    /// 파싱 에러
    #[error("파싱 에러: {0}")]
    Parse(String),

    /// 지원하지 않는 기능
    #[error("지원하지 않는 기능: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// 같은 요청을 다시 보내면 성공할 수 있는 일시적 에러인지.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::Api { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::NotFound(_)
        )
    }

    /// 재시도 전 대기해야 하는 시간 (거래소가 지정한 경우).
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }

    /// 거래소 응답 code (애플리케이션 에러인 경우).
    pub fn api_code(&self) -> Option<&str> {
        match self {
            ProviderError::Api { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

// =============================================================================
// FuturesExchange Trait
// =============================================================================

/// 선물 거래소 클라이언트.
///
/// 모든 호출은 블로킹 I/O 대기이며 HTTP 클라이언트의 타임아웃 외에
/// 별도 타임아웃은 없습니다. 실패는 `ProviderError`로 그대로 전달하며,
/// 재시도는 호출 지점에서 명시적으로 결정합니다.
#[async_trait]
pub trait FuturesExchange: Send + Sync {
    /// 시장가 주문. 거래소 주문 ID 반환.
    async fn place_market_order(
        &self,
        instrument: Instrument,
        quantity: Decimal,
        side: OrderSide,
    ) -> Result<String, ProviderError>;

    /// 지정가 주문. 거래소 주문 ID 반환.
    async fn place_limit_order(
        &self,
        instrument: Instrument,
        quantity: Decimal,
        side: OrderSide,
        price: Decimal,
    ) -> Result<String, ProviderError>;

    /// 일반 주문 취소.
    async fn cancel_order(&self, instrument: Instrument, order_id: &str)
        -> Result<(), ProviderError>;

    /// 보호 주문(손절/익절) 배치. 거래소 주문 ID 반환.
    async fn place_protective_order(
        &self,
        instrument: Instrument,
        plan_type: PlanType,
        trigger_price: Decimal,
        hold_side: Direction,
        quantity: Decimal,
    ) -> Result<String, ProviderError>;

    /// 보호 주문 트리거 가격 정정.
    ///
    /// 같은 가격으로 정정하면 "아직 살아있는지" 확인하는 가벼운 조회로 쓸 수 있습니다.
    /// 주문이 이미 발동되어 없으면 `Ok(ProtectiveOrderStatus::Triggered)`.
    async fn modify_protective_order(
        &self,
        order: &SltpOrder,
        trigger_price: Decimal,
    ) -> Result<ProtectiveOrderStatus, ProviderError>;

    /// 보호 주문 취소.
    async fn cancel_protective_order(&self, order: &SltpOrder) -> Result<(), ProviderError>;

    /// 주문의 체결 상세 조회.
    ///
    /// # Errors
    ///
    /// - `ProviderError::NotFound`: 체결 내역이 아직 반영되지 않음
    async fn query_fill(
        &self,
        instrument: Instrument,
        order_id: &str,
    ) -> Result<FillDetail, ProviderError>;

    /// 주문 상태 조회. 주문이 없으면 `None`.
    async fn query_order_state(
        &self,
        instrument: Instrument,
        order_id: &str,
    ) -> Result<Option<OrderStatus>, ProviderError>;

    /// 마크 가격 조회.
    async fn get_mark_price(&self, instrument: Instrument) -> Result<Decimal, ProviderError>;

    /// 거래소 이름 (로깅용).
    fn exchange_name(&self) -> &str;
}

/// 트레이더별 거래소 클라이언트 생성기.
///
/// 자격증명이 트레이더마다 다르므로 호출 시점에 트레이더로부터 클라이언트를 만듭니다.
pub trait ExchangeFactory: Send + Sync {
    fn for_trader(&self, trader: &Trader) -> Arc<dyn FuturesExchange>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(ProviderError::NotFound("fills".into()).is_retryable());
        assert!(!ProviderError::Parse("bad json".into()).is_retryable());
        assert!(!ProviderError::Authentication("sign".into()).is_retryable());
    }

    #[test]
    fn rate_limit_carries_delay() {
        let err = ProviderError::RateLimited {
            retry_after_ms: Some(1500),
        };
        assert_eq!(err.retry_delay_ms(), Some(1500));
        assert_eq!(ProviderError::Network("x".into()).retry_delay_ms(), None);
    }

    #[test]
    fn order_state_parsing() {
        assert_eq!(OrderState::from_exchange("filled"), Some(OrderState::Filled));
        assert_eq!(OrderState::from_exchange("new"), Some(OrderState::New));
        assert_eq!(OrderState::from_exchange("???"), None);
    }
}
