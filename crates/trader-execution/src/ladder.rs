//! 보호 주문 래더 (손절 1 + 익절 1~3).
//!
//! 가격/수량 계산은 순수 함수이고, 배치(`place_ladder`)와 정리(`retire_ladder`)는
//! 거래소 호출 후 원장에 기록합니다.
//!
//! # 계산 규칙
//!
//! - 손절: `entry × (1 ∓ sl_pct)`, 수량 = 포지션 전체
//! - 익절: `entry × (1 ± tp_pct_i)`, 수량 = `floor_to_step(total / tiers)`, 마지막 단계는 나머지
//! - 익절 수량 합은 `total − reserved` 를 넘지 않음. 0 이 된 단계는 배치하지 않음
//! - 트리거 가격은 0.1 단위 반올림

use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use trader_core::domain::{
    Direction, FuturesExchange, NewSltpOrder, PlanType, Position, PositionLedger, SltpOrder,
};
use trader_core::policy;

use crate::error::{ExecutionError, ExecutionResult};

// =============================================================================
// 래더 계산
// =============================================================================

/// 래더 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderKind {
    /// 최초 진입
    Initial,
    /// 추가 진입 후 재배치
    Expansion,
}

impl LadderKind {
    pub fn stop_loss_pct(&self) -> Decimal {
        match self {
            LadderKind::Initial => policy::INITIAL_STOP_LOSS_PCT,
            LadderKind::Expansion => policy::EXPANSION_STOP_LOSS_PCT,
        }
    }

    /// 익절에 배정하지 않는 수량.
    pub fn reserved_quantity(&self) -> Decimal {
        match self {
            LadderKind::Initial => Decimal::ZERO,
            LadderKind::Expansion => policy::EXPANSION_RESERVED_QUANTITY,
        }
    }
}

/// 래더의 한 단계.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderLevel {
    pub plan_type: PlanType,
    pub trigger_price: Decimal,
    pub quantity: Decimal,
}

/// 계산된 래더.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LadderPlan {
    pub stop_loss: LadderLevel,
    /// 진입가에서 가까운 순
    pub take_profits: Vec<LadderLevel>,
}

impl LadderPlan {
    pub fn levels(&self) -> impl Iterator<Item = &LadderLevel> {
        std::iter::once(&self.stop_loss).chain(self.take_profits.iter())
    }
}

/// 트리거 가격 반올림 (0.1 단위).
pub fn round_trigger(price: Decimal) -> Decimal {
    price.round_dp(policy::TRIGGER_PRICE_DP)
}

/// 수량 단위로 내림.
pub fn floor_to_step(quantity: Decimal) -> Decimal {
    (quantity / policy::QUANTITY_STEP).floor() * policy::QUANTITY_STEP
}

/// 익절 단계별 수량.
///
/// 반환 길이는 항상 `tiers`이며, 0 인 항목은 배치하지 않을 단계입니다.
pub fn tier_quantities(total: Decimal, tiers: usize, reserved: Decimal) -> Vec<Decimal> {
    if tiers == 0 {
        return Vec::new();
    }
    let base = floor_to_step(total / Decimal::from(tiers));
    let last = total - base * Decimal::from(tiers - 1);
    let mut budget = (total - reserved).max(Decimal::ZERO);

    (0..tiers)
        .map(|i| {
            let wanted = if i + 1 == tiers { last } else { base };
            let quantity = wanted.min(budget).max(Decimal::ZERO);
            budget -= quantity;
            quantity
        })
        .collect()
}

/// 진입가 기준 래더 계산.
pub fn compute_ladder(
    direction: Direction,
    entry: Decimal,
    total: Decimal,
    kind: LadderKind,
) -> LadderPlan {
    let sl_pct = kind.stop_loss_pct();
    let stop_loss_price = match direction {
        Direction::Long => entry * (Decimal::ONE - sl_pct),
        Direction::Short => entry * (Decimal::ONE + sl_pct),
    };

    let quantities = tier_quantities(
        total,
        policy::TAKE_PROFIT_PCTS.len(),
        kind.reserved_quantity(),
    );
    let take_profits = policy::TAKE_PROFIT_PCTS
        .iter()
        .zip(quantities)
        .filter(|(_, quantity)| *quantity > Decimal::ZERO)
        .map(|(pct, quantity)| {
            let price = match direction {
                Direction::Long => entry * (Decimal::ONE + pct),
                Direction::Short => entry * (Decimal::ONE - pct),
            };
            LadderLevel {
                plan_type: PlanType::TakeProfit,
                trigger_price: round_trigger(price),
                quantity,
            }
        })
        .collect();

    LadderPlan {
        stop_loss: LadderLevel {
            plan_type: PlanType::StopLoss,
            trigger_price: round_trigger(stop_loss_price),
            quantity: total,
        },
        take_profits,
    }
}

/// 손절을 본전으로 옮길 만큼 가격이 유리하게 움직였는지.
pub fn trail_threshold_reached(direction: Direction, entry: Decimal, mark: Decimal) -> bool {
    match direction {
        Direction::Long => mark >= entry * policy::TRAIL_TRIGGER_LONG,
        Direction::Short => mark <= entry * policy::TRAIL_TRIGGER_SHORT,
    }
}

/// 새 손절 가격이 기존보다 손실을 줄이는 방향인지.
pub fn tightens(direction: Direction, current: Decimal, proposed: Decimal) -> bool {
    match direction {
        Direction::Long => proposed > current,
        Direction::Short => proposed < current,
    }
}

/// 익절 주문을 진입가에서 가까운 순으로 정렬 (롱: 오름차순, 숏: 내림차순).
pub fn sort_by_proximity(direction: Direction, take_profits: &mut [SltpOrder]) {
    match direction {
        Direction::Long => take_profits.sort_by(|a, b| a.trigger_price.cmp(&b.trigger_price)),
        Direction::Short => take_profits.sort_by(|a, b| b.trigger_price.cmp(&a.trigger_price)),
    }
}

// =============================================================================
// 배치 / 정리
// =============================================================================

/// 래더를 거래소에 배치하고 원장에 기록.
///
/// 한 단계라도 거래소 배치가 실패하면 이미 배치한 주문을 취소하고
/// `ExecutionError::LadderPlacement`를 반환합니다. 원장 기록이 실패해도
/// 방금 배치한 주문까지 취소한 뒤 원장 에러를 반환합니다.
pub async fn place_ladder(
    ledger: &dyn PositionLedger,
    exchange: &dyn FuturesExchange,
    position: &Position,
    plan: &LadderPlan,
) -> ExecutionResult<Vec<SltpOrder>> {
    let mut placed: Vec<SltpOrder> = Vec::with_capacity(1 + plan.take_profits.len());

    for level in plan.levels() {
        let remote_id = match exchange
            .place_protective_order(
                position.instrument,
                level.plan_type,
                level.trigger_price,
                position.direction,
                level.quantity,
            )
            .await
        {
            Ok(id) => id,
            Err(source) => {
                warn!(
                    position_id = position.id,
                    plan_type = %level.plan_type,
                    error = %source,
                    "보호 주문 배치 실패, 배치된 주문 취소"
                );
                retire_orders(ledger, exchange, position.id, &placed).await;
                return Err(ExecutionError::LadderPlacement {
                    position_id: position.id,
                    source,
                });
            }
        };

        let new = NewSltpOrder {
            position_id: position.id,
            trader_id: position.trader_id,
            instrument: position.instrument,
            plan_type: level.plan_type,
            trigger_price: level.trigger_price,
            quantity: level.quantity,
            remote_id,
        };
        let order = match ledger.create_sltp_order(new.clone()).await {
            Ok(order) => order,
            Err(e) => {
                warn!(
                    position_id = position.id,
                    remote_id = %new.remote_id,
                    error = %e,
                    "보호 주문 기록 실패, 배치된 주문 취소"
                );
                cancel_on_exchange(exchange, &[new.unrecorded()]).await;
                retire_orders(ledger, exchange, position.id, &placed).await;
                return Err(e.into());
            }
        };
        debug!(
            position_id = position.id,
            order_id = order.id,
            plan_type = %order.plan_type,
            trigger_price = %order.trigger_price,
            quantity = %order.quantity,
            "보호 주문 배치"
        );
        placed.push(order);
    }

    info!(
        position_id = position.id,
        stop_loss = %plan.stop_loss.trigger_price,
        take_profits = plan.take_profits.len(),
        "보호 주문 래더 배치 완료"
    );
    Ok(placed)
}

/// 포지션의 Active 보호 주문을 모두 거래소에서 취소(최선 노력)하고 원장에서 Inactive 로 전환.
///
/// 취소 결과와 무관하게 원장은 Inactive 로 바뀝니다. 바뀐 개수를 반환합니다.
pub async fn retire_ladder(
    ledger: &dyn PositionLedger,
    exchange: &dyn FuturesExchange,
    position_id: i64,
) -> ExecutionResult<u64> {
    let active = ledger.active_sltp_orders(position_id).await?;
    cancel_on_exchange(exchange, &active).await;
    Ok(ledger.inactivate_all_sltp_orders(position_id).await?)
}

async fn retire_orders(
    ledger: &dyn PositionLedger,
    exchange: &dyn FuturesExchange,
    position_id: i64,
    orders: &[SltpOrder],
) {
    cancel_on_exchange(exchange, orders).await;
    for order in orders {
        if let Err(e) = ledger.inactivate_sltp_order(order.id).await {
            warn!(position_id, order_id = order.id, error = %e, "보호 주문 비활성화 실패");
        }
    }
}

/// 거래소 취소 (실패는 로그만).
pub(crate) async fn cancel_on_exchange(exchange: &dyn FuturesExchange, orders: &[SltpOrder]) {
    for order in orders {
        if let Err(e) = exchange.cancel_protective_order(order).await {
            warn!(
                position_id = order.position_id,
                order_id = order.id,
                remote_id = %order.remote_id,
                error = %e,
                "보호 주문 취소 실패"
            );
        }
    }
}
