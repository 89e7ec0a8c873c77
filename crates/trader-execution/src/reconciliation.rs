//! 체결 반영 (거래소 체결 → 원장).
//!
//! 주문 ID로 체결 상세를 조회해 원장에 한 트랜잭션으로 반영한 뒤,
//! 포지션 수량이 체결 이력의 부호 있는 합과 같은지 확인합니다.

use tracing::{info, instrument, warn};
use trader_core::domain::{
    net_quantity, FillSide, FuturesExchange, Instrument, Position, PositionLedger,
};
use trader_exchange::{with_retry, RetryConfig};

use crate::error::{ExecutionError, ExecutionResult};

/// 주문 1건의 체결을 원장에 반영.
///
/// 체결 내역은 주문 접수 직후 조금 늦게 나타나므로 `retry` 설정으로 재조회합니다.
///
/// # Errors
///
/// - `ExecutionError::Exchange`: 재시도 후에도 체결 조회 실패
/// - `ExecutionError::Invariant`: 반영 후 수량이 체결 이력 합과 다름
#[instrument(skip(ledger, exchange, retry))]
pub async fn reconcile_fill(
    ledger: &dyn PositionLedger,
    exchange: &dyn FuturesExchange,
    retry: &RetryConfig,
    position_id: i64,
    instrument: Instrument,
    order_id: &str,
) -> ExecutionResult<Position> {
    let fill = with_retry(retry, || exchange.query_fill(instrument, order_id)).await?;
    if fill.side == FillSide::Unknown {
        warn!(position_id, order_id, "알 수 없는 체결 방향, 수량 변경 없이 기록");
    }

    let (position, action) = ledger.apply_fill(position_id, order_id, &fill).await?;

    let actions = ledger.position_actions(position_id).await?;
    let expected = net_quantity(&actions);
    if position.quantity != expected {
        return Err(ExecutionError::Invariant {
            position_id,
            reason: format!(
                "quantity {} != signed fill history {}",
                position.quantity, expected
            ),
        });
    }

    info!(
        position_id,
        order_id,
        side = %action.side,
        price = %action.price,
        quantity = %action.quantity,
        position_quantity = %position.quantity,
        state = ?position.state,
        "체결 반영 완료"
    );
    Ok(position)
}

/// 여러 주문의 체결을 순서대로 반영하고 마지막 포지션 상태를 반환.
pub async fn reconcile_fills(
    ledger: &dyn PositionLedger,
    exchange: &dyn FuturesExchange,
    retry: &RetryConfig,
    position_id: i64,
    instrument: Instrument,
    order_ids: &[String],
) -> ExecutionResult<Position> {
    let mut position = None;
    for order_id in order_ids {
        position =
            Some(reconcile_fill(ledger, exchange, retry, position_id, instrument, order_id).await?);
    }
    match position {
        Some(p) => Ok(p),
        None => Ok(ledger.get_position(position_id).await?),
    }
}
