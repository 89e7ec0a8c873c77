//! 거래소 연동 계층.
//!
//! - `connector`: 서명된 REST 클라이언트 (거래소 고유 프로토콜)
//! - `provider`: `FuturesExchange` 구현체 (거래소 중립 인터페이스)
//! - `retry`, `limit_order`: 재시도 정책과 지정가 우선 주문

pub mod connector;
pub mod limit_order;
pub mod provider;
pub mod retry;

pub use limit_order::{place_limit_with_fallback, LimitFallbackConfig};
pub use provider::{
    CoincatchExchangeFactory, CoincatchExchangeProvider, LimitBehavior, MockExchangeProvider,
};
pub use retry::{with_retry, RetryConfig};
