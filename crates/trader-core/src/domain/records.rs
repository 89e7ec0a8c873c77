//! 원장 레코드: 트레이더, 포지션, 체결 이력, 보호 주문.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::types::{Direction, FillSide, Instrument, PlanType, RecordState};

// =============================================================================
// 트레이더
// =============================================================================

/// 거래소 API 자격증명.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl ApiCredentials {
    pub fn new(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            passphrase: passphrase.into(),
        }
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"***")
            .field("secret_key", &"***")
            .field("passphrase", &"***")
            .finish()
    }
}

/// 트레이더 (거래소 계정 1개).
#[derive(Debug, Clone)]
pub struct Trader {
    pub id: i64,
    pub name: String,
    pub credentials: ApiCredentials,
    /// 누적 실현 손익
    pub pnl: Decimal,
}

// =============================================================================
// 포지션
// =============================================================================

/// 트레이더 1명의 상품 1개에 대한 포지션.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub trader_id: i64,
    pub instrument: Instrument,
    pub direction: Direction,
    /// 누적 수량 (체결 이력의 부호 있는 합)
    pub quantity: Decimal,
    pub state: RecordState,
    /// 첫 체결 확인 여부
    pub is_ever_updated: bool,
    /// 진입 횟수 (최초 진입 + 추가 진입)
    pub number_of_openings: i32,
    pub pnl: Decimal,
    /// 감사 로그 (append-only)
    pub trace: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Position {
    pub fn is_active(&self) -> bool {
        self.state == RecordState::Active
    }
}

/// 신규 포지션 생성 요청.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub trader_id: i64,
    pub instrument: Instrument,
    pub direction: Direction,
    /// 요청 수량 (첫 체결 확인 시 실제 체결 수량으로 대체됨)
    pub quantity: Decimal,
}

// =============================================================================
// 체결 이력
// =============================================================================

/// 체결 1건 (불변).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionAction {
    pub id: i64,
    pub position_id: i64,
    pub trader_id: i64,
    pub side: FillSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub instrument: Instrument,
    /// 거래소 주문 ID
    pub remote_id: String,
    pub profit: Decimal,
    pub fee: Decimal,
    pub created: DateTime<Utc>,
}

/// 체결 이력의 부호 있는 수량 합.
///
/// 진입은 +, 청산은 -, 알 수 없는 방향은 제외합니다.
/// 포지션의 `quantity`는 항상 이 값과 같아야 합니다.
pub fn net_quantity(actions: &[PositionAction]) -> Decimal {
    actions
        .iter()
        .map(|a| a.side.signed_quantity(a.quantity))
        .sum()
}

/// 진입 체결들의 거래량 가중 평균가.
///
/// 진입 체결이 없으면 `None`.
pub fn average_entry_price(actions: &[PositionAction]) -> Option<Decimal> {
    let (notional, quantity) = actions
        .iter()
        .filter(|a| a.side.is_opening())
        .fold((Decimal::ZERO, Decimal::ZERO), |(n, q), a| {
            (n + a.price * a.quantity, q + a.quantity)
        });

    if quantity.is_zero() {
        None
    } else {
        Some(notional / quantity)
    }
}

// =============================================================================
// 보호 주문 (SLTP)
// =============================================================================

/// 포지션에 연결된 보호 주문 (손절/익절).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SltpOrder {
    pub id: i64,
    pub position_id: i64,
    pub trader_id: i64,
    pub instrument: Instrument,
    pub plan_type: PlanType,
    pub trigger_price: Decimal,
    pub quantity: Decimal,
    pub state: RecordState,
    /// 거래소 주문 ID
    pub remote_id: String,
    pub trace: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl SltpOrder {
    pub fn is_active(&self) -> bool {
        self.state == RecordState::Active
    }

    pub fn is_stop_loss(&self) -> bool {
        self.plan_type == PlanType::StopLoss
    }
}

/// 거래소에 배치된 보호 주문의 원장 기록 요청.
#[derive(Debug, Clone)]
pub struct NewSltpOrder {
    pub position_id: i64,
    pub trader_id: i64,
    pub instrument: Instrument,
    pub plan_type: PlanType,
    pub trigger_price: Decimal,
    pub quantity: Decimal,
    pub remote_id: String,
}

impl NewSltpOrder {
    /// 원장에 기록되지 못한 주문 (거래소 취소용, id 0 / Inactive).
    pub fn unrecorded(&self) -> SltpOrder {
        let now = Utc::now();
        SltpOrder {
            id: 0,
            position_id: self.position_id,
            trader_id: self.trader_id,
            instrument: self.instrument,
            plan_type: self.plan_type,
            trigger_price: self.trigger_price,
            quantity: self.quantity,
            state: RecordState::Inactive,
            remote_id: self.remote_id.clone(),
            trace: String::new(),
            created: now,
            updated: now,
        }
    }
}
