//! 포지션 원장 저장소 추상화.
//!
//! 트레이더/포지션/체결 이력/보호 주문에 대한 모든 읽기·쓰기는
//! 이 trait을 통해서만 이루어집니다. 불변식(트레이더당 Active 포지션 1개,
//! Active 포지션당 Active 손절 1개)은 구현체가 한 곳에서 강제합니다.
//!
//! # 구현체
//!
//! - `trader_data::PgLedger`: PostgreSQL (운영)
//! - `trader_data::MemoryLedger`: 프로세스 내 메모리 (테스트/페이퍼 트레이딩)

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use super::exchange_provider::FillDetail;
use super::records::{
    NewPosition, NewSltpOrder, Position, PositionAction, SltpOrder, Trader,
};
use super::types::RecordState;

// =============================================================================
// 에러 타입
// =============================================================================

/// 원장 에러.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// 저장소 백엔드 에러 (DB 연결, 쿼리 실패 등)
    #[error("저장소 에러: {0}")]
    Backend(String),

    /// 레코드 없음
    #[error("{entity} #{id} 를 찾을 수 없습니다")]
    NotFound { entity: &'static str, id: i64 },

    /// 불변식 위반으로 쓰기가 거부됨
    #[error("원장 불변식 위반: {0}")]
    Conflict(String),

    /// 저장된 값이 도메인 타입으로 해석되지 않음
    #[error("손상된 레코드: {0}")]
    Corrupt(String),
}

// =============================================================================
// 행 잠금
// =============================================================================

/// 포지션 행 잠금 핸들.
///
/// 핸들이 살아있는 동안 같은 포지션에 대한 다른 `lock_position` 호출은 대기합니다.
/// `release()` 없이 drop 되어도 잠금은 풀립니다.
#[async_trait]
pub trait PositionLockGuard: Send {
    /// 잠긴 포지션 ID.
    fn position_id(&self) -> i64;

    /// 잠금 해제.
    async fn release(self: Box<Self>) -> Result<(), LedgerError>;
}

// =============================================================================
// PositionLedger Trait
// =============================================================================

/// 포지션 원장.
#[async_trait]
pub trait PositionLedger: Send + Sync {
    // ===== 트레이더 =====

    /// 전체 트레이더 조회.
    async fn list_traders(&self) -> Result<Vec<Trader>, LedgerError>;

    /// 트레이더 조회.
    async fn get_trader(&self, trader_id: i64) -> Result<Trader, LedgerError>;

    // ===== 포지션 =====

    /// 트레이더의 Active 포지션 목록.
    ///
    /// 정상 상태에서는 0개 또는 1개입니다. 개수 검증은 호출자 몫입니다.
    async fn active_positions(&self, trader_id: i64) -> Result<Vec<Position>, LedgerError>;

    /// 모든 트레이더의 Active 포지션 (기동 시 모니터 복구, 상태 조회용).
    async fn all_active_positions(&self) -> Result<Vec<Position>, LedgerError>;

    async fn get_position(&self, position_id: i64) -> Result<Position, LedgerError>;

    /// Active 상태로 신규 포지션 생성.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Conflict`: 트레이더에게 이미 Active 포지션이 있음
    async fn create_position(&self, new: NewPosition) -> Result<Position, LedgerError>;

    /// 진입 횟수 1 증가.
    async fn record_opening(&self, position_id: i64) -> Result<Position, LedgerError>;

    async fn set_position_state(
        &self,
        position_id: i64,
        state: RecordState,
    ) -> Result<(), LedgerError>;

    /// 감사 로그에 한 줄 추가 (원자적 append).
    async fn append_position_comment(
        &self,
        position_id: i64,
        comment: &str,
    ) -> Result<(), LedgerError>;

    /// 포지션 행 잠금 획득 (추가 진입/청산 동안 유지).
    async fn lock_position(
        &self,
        position_id: i64,
    ) -> Result<Box<dyn PositionLockGuard>, LedgerError>;

    // ===== 체결 반영 =====

    /// 거래소 체결을 원장에 반영 (단일 트랜잭션).
    ///
    /// 체결 이력 추가, 수량(진입 +, 청산 -, 알 수 없음 0) 갱신,
    /// 손익 누적(`profit + fee`), 첫 체결 플래그, 감사 로그 추가,
    /// 수량 ≤ 0 이면 Inactive 전환을 모두 하거나 모두 하지 않습니다.
    ///
    /// 첫 체결은 생성 시의 요청 수량을 실제 체결 수량으로 대체합니다.
    async fn apply_fill(
        &self,
        position_id: i64,
        remote_id: &str,
        fill: &FillDetail,
    ) -> Result<(Position, PositionAction), LedgerError>;

    /// 보호 주문 발동을 원장에 반영 (단일 트랜잭션).
    ///
    /// 트리거 가격으로 청산 체결 이력을 추가하고, 수량을 주문 수량만큼 줄이고,
    /// 해당 보호 주문을 Inactive 로 바꾸고, 감사 로그를 추가합니다.
    /// `close_position`이면 남은 보호 주문을 모두 Inactive 로 바꾸고
    /// 포지션도 Inactive 로 전환합니다.
    async fn apply_protective_fill(
        &self,
        position_id: i64,
        order_id: i64,
        close_position: bool,
        comment: &str,
    ) -> Result<Position, LedgerError>;

    async fn position_actions(&self, position_id: i64)
        -> Result<Vec<PositionAction>, LedgerError>;

    // ===== 보호 주문 =====

    /// Active 상태로 보호 주문 기록.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Conflict`: 손절 주문인데 이미 Active 손절이 있음
    async fn create_sltp_order(&self, new: NewSltpOrder) -> Result<SltpOrder, LedgerError>;

    async fn get_sltp_order(&self, order_id: i64) -> Result<SltpOrder, LedgerError>;

    async fn active_sltp_orders(&self, position_id: i64) -> Result<Vec<SltpOrder>, LedgerError>;

    async fn inactivate_sltp_order(&self, order_id: i64) -> Result<(), LedgerError>;

    /// 포지션의 Active 보호 주문을 모두 Inactive 로 전환. 바뀐 개수 반환.
    async fn inactivate_all_sltp_orders(&self, position_id: i64) -> Result<u64, LedgerError>;

    async fn update_trigger_price(
        &self,
        order_id: i64,
        trigger_price: Decimal,
    ) -> Result<(), LedgerError>;
}
