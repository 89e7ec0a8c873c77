//! FuturesExchange 구현체.
//!
//! # Provider 구조
//!
//! 모든 거래소는 `XXXExchangeProvider` 패턴을 따릅니다:
//! - [`CoincatchExchangeProvider`]: CoinCatch USDT 마진 선물
//! - [`MockExchangeProvider`]: 테스트/페이퍼 트레이딩용 시뮬레이터

mod coincatch;
mod mock;

pub use coincatch::{CoincatchExchangeFactory, CoincatchExchangeProvider};
pub use mock::{LimitBehavior, MockExchangeProvider, MockOrder, MockPlanOrder};
