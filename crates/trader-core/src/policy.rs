//! 전략 정책 상수.
//!
//! 손절/익절 오프셋, 트레일링 임계값, 수량 등은 런타임 설정이 아닌
//! 컴파일 타임 상수입니다.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::Instrument;

/// 거래 상품.
pub const INSTRUMENT: Instrument = Instrument::BtcFutures;

// ==================== 수량 ====================

/// 최초 진입 수량.
pub const BASE_QUANTITY: Decimal = dec!(0.003);

/// 추가 진입 1회 수량.
pub const EXPANSION_QUANTITY: Decimal = dec!(0.003);

/// 포지션당 최대 진입 횟수 (최초 + 추가).
pub const MAX_OPENINGS: i32 = 2;

/// 주문 수량 단위.
pub const QUANTITY_STEP: Decimal = dec!(0.001);

/// 트리거 가격 소수 자릿수.
pub const TRIGGER_PRICE_DP: u32 = 1;

/// 추가 진입 후 익절 주문에 배정하지 않고 남겨두는 수량.
pub const EXPANSION_RESERVED_QUANTITY: Decimal = dec!(0.001);

// ==================== 래더 ====================

/// 최초 진입 손절 오프셋 (0.5%).
pub const INITIAL_STOP_LOSS_PCT: Decimal = dec!(0.005);

/// 추가 진입 후 손절 오프셋 (0.9%).
pub const EXPANSION_STOP_LOSS_PCT: Decimal = dec!(0.009);

/// 익절 단계별 오프셋 (진입가에서 가까운 순).
pub const TAKE_PROFIT_PCTS: [Decimal; 3] = [dec!(0.01), dec!(0.02), dec!(0.03)];

/// 포지션당 최대 Active 익절 주문 수.
pub const MAX_TAKE_PROFITS: usize = TAKE_PROFIT_PCTS.len();

// ==================== 트레일링 ====================

/// 롱: 마크 가격이 진입가 × 이 값 이상이면 손절을 본전으로 이동.
pub const TRAIL_TRIGGER_LONG: Decimal = dec!(1.0038);

/// 숏: 마크 가격이 진입가 × 이 값 이하이면 손절을 본전으로 이동.
pub const TRAIL_TRIGGER_SHORT: Decimal = dec!(0.9938);

// ==================== 타이밍 ====================

/// 주문 모니터 폴링 주기.
pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// 지정가 주문 체결 대기 시간.
pub const LIMIT_SETTLE_INTERVAL: Duration = Duration::from_secs(2);

/// 지정가 주문 재시도 횟수 (이후 시장가로 전환).
pub const LIMIT_MAX_ATTEMPTS: u32 = 3;

/// 롱 시그널 처리 시간 예산 (트레이더당).
pub const LONG_SIGNAL_BUDGET: Duration = Duration::from_secs(30);

/// 숏 시그널 처리 시간 예산 (트레이더당).
pub const SHORT_SIGNAL_BUDGET: Duration = Duration::from_secs(20);
