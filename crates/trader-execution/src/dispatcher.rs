//! 시그널 디스패처.
//!
//! 트레이더 1명에 대한 방향 시그널을 진입/추가 진입/청산으로 변환합니다.
//!
//! # 설계 원칙
//!
//! - **정합성 우선**: Active 포지션이 2개 이상이면 원장을 건드리지 않고 중단
//! - **이중 잠금**: 추가 진입/청산은 상태 채널에 `Changing`을 쓰고(권고),
//!   원장 행 잠금을 잡은 뒤(강제) 포지션을 다시 읽어 진행
//! - **보호 우선**: 래더 배치에 실패한 포지션은 시장가로 정리
//! - **체결 미확인 되돌림**: 진입/추가 진입 체결을 원장에 반영하지 못하면
//!   그 주문을 시장가로 되돌리고, 진입 횟수는 반영에 성공한 뒤에만 올림

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, instrument, warn};
use trader_core::domain::{
    average_entry_price, Direction, FuturesExchange, Instrument, NewPosition, Position,
    PositionStatus, RecordState, Trader,
};
use trader_core::policy;

use crate::context::ExecutionContext;
use crate::error::{ExecutionError, ExecutionResult};
use crate::ladder::{compute_ladder, place_ladder, retire_ladder, LadderKind};
use crate::monitor::MonitorRegistry;
use crate::orders::submit_order;
use crate::reconciliation::reconcile_fills;

/// 시그널 처리 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 신규 포지션 진입
    Opened { position_id: i64 },
    /// 같은 방향 추가 진입
    Expanded { position_id: i64 },
    /// 반대 방향 포지션 청산만 수행
    Closed { position_id: i64 },
    /// 반대 방향 청산 후 신규 진입
    Reversed { closed: i64, opened: i64 },
    /// 할 일 없음 (최대 진입 횟수 도달, 청산 전용 시그널인데 대상 없음 등)
    NoOp,
}

/// 시그널 디스패처.
#[derive(Debug, Clone)]
pub struct SignalDispatcher {
    ctx: ExecutionContext,
    monitors: Arc<MonitorRegistry>,
}

impl SignalDispatcher {
    pub fn new(ctx: ExecutionContext, monitors: Arc<MonitorRegistry>) -> Self {
        Self { ctx, monitors }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    /// 트레이더 1명에 대한 시그널 처리.
    ///
    /// `just_close`면 진입/추가 진입 없이 반대 방향 포지션 청산만 합니다.
    ///
    /// # Errors
    ///
    /// - `ExecutionError::Consistency`: Active 포지션이 2개 이상 (원장 변경 없음)
    #[instrument(skip(self), fields(trader = tracing::field::Empty))]
    pub async fn dispatch(
        &self,
        trader_id: i64,
        direction: Direction,
        just_close: bool,
    ) -> ExecutionResult<DispatchOutcome> {
        let (trader, exchange) = self.ctx.trader_exchange(trader_id).await?;
        tracing::Span::current().record("trader", trader.name.as_str());

        let mut active = self.ctx.ledger.active_positions(trader_id).await?;
        if active.len() > 1 {
            error!(
                trader = %trader.name,
                count = active.len(),
                "Active 포지션이 2개 이상, 시그널 처리 중단"
            );
            return Err(ExecutionError::Consistency(format!(
                "trader {} has {} active positions",
                trader.name,
                active.len()
            )));
        }

        match active.pop() {
            None if just_close => {
                info!(trader = %trader.name, "청산 전용 시그널, 청산할 포지션 없음");
                Ok(DispatchOutcome::NoOp)
            }
            None => {
                let position_id = self.open(&trader, exchange.as_ref(), direction).await?;
                Ok(DispatchOutcome::Opened { position_id })
            }
            Some(position) if position.direction == direction => {
                if just_close {
                    info!(position_id = position.id, "청산 전용 시그널, 같은 방향 포지션 유지");
                    return Ok(DispatchOutcome::NoOp);
                }
                self.expand(exchange.as_ref(), &position).await
            }
            Some(position) => {
                let closed = position.id;
                self.close(exchange.as_ref(), &position, direction).await?;
                if just_close {
                    return Ok(DispatchOutcome::Closed { position_id: closed });
                }
                let opened = self.open(&trader, exchange.as_ref(), direction).await?;
                Ok(DispatchOutcome::Reversed { closed, opened })
            }
        }
    }

    // ==================== 진입 ====================

    /// 신규 포지션 진입 후 래더 배치, 모니터 시작.
    async fn open(
        &self,
        trader: &Trader,
        exchange: &dyn FuturesExchange,
        direction: Direction,
    ) -> ExecutionResult<i64> {
        let instrument = policy::INSTRUMENT;
        let order_ids = submit_order(
            exchange,
            &self.ctx.config,
            instrument,
            policy::BASE_QUANTITY,
            direction.open_side(),
        )
        .await?;

        let position = match self
            .ctx
            .ledger
            .create_position(NewPosition {
                trader_id: trader.id,
                instrument,
                direction,
                quantity: policy::BASE_QUANTITY,
            })
            .await
        {
            Ok(p) => p,
            Err(e) => {
                error!(trader = %trader.name, error = %e, "포지션 기록 실패, 진입 주문 되돌림");
                reverse_fill(exchange, instrument, direction, policy::BASE_QUANTITY).await;
                return Err(e.into());
            }
        };

        let position = match reconcile_fills(
            self.ctx.ledger.as_ref(),
            exchange,
            &self.ctx.config.fill_retry,
            position.id,
            instrument,
            &order_ids,
        )
        .await
        {
            Ok(p) => p,
            Err(e) => {
                error!(
                    trader = %trader.name,
                    position_id = position.id,
                    error = %e,
                    "진입 체결 반영 실패, 진입 주문 되돌림"
                );
                reverse_fill(exchange, instrument, direction, policy::BASE_QUANTITY).await;
                self.abandon(position.id, &e).await;
                return Err(e);
            }
        };
        self.ctx.ledger.record_opening(position.id).await?;
        info!(
            trader = %trader.name,
            position_id = position.id,
            %direction,
            quantity = %position.quantity,
            "포지션 진입"
        );

        self.protect(exchange, &position, LadderKind::Initial).await?;
        self.monitors.ensure_running(position.id);
        Ok(position.id)
    }

    // ==================== 추가 진입 ====================

    async fn expand(
        &self,
        exchange: &dyn FuturesExchange,
        position: &Position,
    ) -> ExecutionResult<DispatchOutcome> {
        if position.number_of_openings >= policy::MAX_OPENINGS {
            info!(
                position_id = position.id,
                openings = position.number_of_openings,
                "최대 진입 횟수 도달, 추가 진입 생략"
            );
            return Ok(DispatchOutcome::NoOp);
        }

        self.ctx
            .status
            .publish(position.id, PositionStatus::Changing)
            .await;
        let result = self.expand_locked(exchange, position.id).await;
        self.ctx
            .status
            .publish(position.id, PositionStatus::Finished)
            .await;

        if matches!(result, Ok(DispatchOutcome::Expanded { .. })) {
            self.monitors.ensure_running(position.id);
        }
        result
    }

    async fn expand_locked(
        &self,
        exchange: &dyn FuturesExchange,
        position_id: i64,
    ) -> ExecutionResult<DispatchOutcome> {
        let guard = self.ctx.ledger.lock_position(position_id).await?;

        let result = self.expand_position(exchange, position_id).await;

        if let Err(e) = guard.release().await {
            warn!(position_id, error = %e, "포지션 잠금 해제 실패");
        }
        result
    }

    async fn expand_position(
        &self,
        exchange: &dyn FuturesExchange,
        position_id: i64,
    ) -> ExecutionResult<DispatchOutcome> {
        let position = self.ctx.ledger.get_position(position_id).await?;
        if !position.is_active() || position.number_of_openings >= policy::MAX_OPENINGS {
            info!(
                position_id,
                state = ?position.state,
                openings = position.number_of_openings,
                "잠금 후 재확인: 추가 진입 대상 아님"
            );
            return Ok(DispatchOutcome::NoOp);
        }

        let order_ids = submit_order(
            exchange,
            &self.ctx.config,
            position.instrument,
            policy::EXPANSION_QUANTITY,
            position.direction.open_side(),
        )
        .await?;
        let before = position;
        let position = match reconcile_fills(
            self.ctx.ledger.as_ref(),
            exchange,
            &self.ctx.config.fill_retry,
            position_id,
            before.instrument,
            &order_ids,
        )
        .await
        {
            Ok(p) => p,
            Err(e) => {
                self.undo_expansion(exchange, &before, &e).await;
                return Err(e);
            }
        };
        self.ctx.ledger.record_opening(position_id).await?;

        let retired = retire_ladder(self.ctx.ledger.as_ref(), exchange, position_id).await?;
        self.ctx
            .ledger
            .append_position_comment(
                position_id,
                &format!(
                    "expanded by {}: {} protective orders replaced",
                    policy::EXPANSION_QUANTITY,
                    retired
                ),
            )
            .await?;
        info!(
            position_id,
            quantity = %position.quantity,
            retired,
            "추가 진입 완료, 래더 재배치"
        );

        self.protect(exchange, &position, LadderKind::Expansion).await?;
        Ok(DispatchOutcome::Expanded { position_id })
    }

    /// 체결 반영에 실패한 추가 진입분을 되돌림.
    ///
    /// 원장에 이미 반영된 체결은 남기고 반영되지 못한 수량만 시장가로 되돌립니다.
    /// 진입 횟수와 기존 래더는 그대로 둡니다.
    async fn undo_expansion(
        &self,
        exchange: &dyn FuturesExchange,
        before: &Position,
        cause: &ExecutionError,
    ) {
        let applied = match self.ctx.ledger.get_position(before.id).await {
            Ok(current) => current.quantity - before.quantity,
            Err(e) => {
                warn!(position_id = before.id, error = %e, "포지션 재조회 실패");
                Decimal::ZERO
            }
        };
        let unapplied = (policy::EXPANSION_QUANTITY - applied)
            .max(Decimal::ZERO)
            .min(policy::EXPANSION_QUANTITY);
        error!(
            position_id = before.id,
            error = %cause,
            %applied,
            %unapplied,
            "추가 진입 체결 반영 실패, 미반영 수량 되돌림"
        );
        reverse_fill(exchange, before.instrument, before.direction, unapplied).await;
        if let Err(e) = self
            .ctx
            .ledger
            .append_position_comment(
                before.id,
                &format!("expansion unwound ({} reversed): {}", unapplied, cause),
            )
            .await
        {
            warn!(position_id = before.id, error = %e, "감사 로그 기록 실패");
        }
    }

    // ==================== 청산 ====================

    /// 반대 방향 포지션 청산.
    async fn close(
        &self,
        exchange: &dyn FuturesExchange,
        position: &Position,
        signal: Direction,
    ) -> ExecutionResult<()> {
        self.ctx
            .status
            .publish(position.id, PositionStatus::Changing)
            .await;
        let result = self.close_locked(exchange, position.id, signal).await;
        self.ctx
            .status
            .publish(position.id, PositionStatus::Finished)
            .await;
        result
    }

    async fn close_locked(
        &self,
        exchange: &dyn FuturesExchange,
        position_id: i64,
        signal: Direction,
    ) -> ExecutionResult<()> {
        let guard = self.ctx.ledger.lock_position(position_id).await?;

        let result = self.close_position(exchange, position_id, signal).await;

        if let Err(e) = guard.release().await {
            warn!(position_id, error = %e, "포지션 잠금 해제 실패");
        }
        result
    }

    async fn close_position(
        &self,
        exchange: &dyn FuturesExchange,
        position_id: i64,
        signal: Direction,
    ) -> ExecutionResult<()> {
        let position = self.ctx.ledger.get_position(position_id).await?;
        if !position.is_active() {
            info!(position_id, "이미 종료된 포지션, 청산 생략");
            return Ok(());
        }

        self.flatten(exchange, &position).await?;
        self.ctx
            .ledger
            .append_position_comment(position_id, &format!("closed by {} signal", signal))
            .await?;
        info!(position_id, direction = %position.direction, "포지션 청산 완료");
        Ok(())
    }

    /// 남은 수량 시장가 청산, 보호 주문 정리, Inactive 전환.
    async fn flatten(
        &self,
        exchange: &dyn FuturesExchange,
        position: &Position,
    ) -> ExecutionResult<()> {
        if position.quantity > Decimal::ZERO {
            let order_ids = submit_order(
                exchange,
                &self.ctx.config,
                position.instrument,
                position.quantity,
                position.direction.close_side(),
            )
            .await?;
            reconcile_fills(
                self.ctx.ledger.as_ref(),
                exchange,
                &self.ctx.config.fill_retry,
                position.id,
                position.instrument,
                &order_ids,
            )
            .await?;
        }

        retire_ladder(self.ctx.ledger.as_ref(), exchange, position.id).await?;
        self.ctx
            .ledger
            .set_position_state(position.id, RecordState::Inactive)
            .await?;
        Ok(())
    }

    /// 보호 주문 없이 남은 포지션을 원장에서 닫음 (최선 노력).
    async fn abandon(&self, position_id: i64, cause: &ExecutionError) {
        if let Err(e) = self
            .ctx
            .ledger
            .set_position_state(position_id, RecordState::Inactive)
            .await
        {
            error!(position_id, error = %e, "포지션 비활성화 실패");
        }
        if let Err(e) = self
            .ctx
            .ledger
            .append_position_comment(position_id, &format!("unwound: {}", cause))
            .await
        {
            warn!(position_id, error = %e, "감사 로그 기록 실패");
        }
    }

    // ==================== 래더 ====================

    /// 평균 진입가 기준 래더 배치. 실패하면 포지션을 시장가로 정리.
    async fn protect(
        &self,
        exchange: &dyn FuturesExchange,
        position: &Position,
        kind: LadderKind,
    ) -> ExecutionResult<()> {
        let actions = self.ctx.ledger.position_actions(position.id).await?;
        let entry = average_entry_price(&actions).ok_or_else(|| ExecutionError::Invariant {
            position_id: position.id,
            reason: "no opening fill to derive entry price".to_string(),
        })?;
        if !position.is_active() || position.quantity <= Decimal::ZERO {
            return Err(ExecutionError::Invariant {
                position_id: position.id,
                reason: format!("cannot protect position with quantity {}", position.quantity),
            });
        }

        let plan = compute_ladder(position.direction, entry, position.quantity, kind);
        match place_ladder(self.ctx.ledger.as_ref(), exchange, position, &plan).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(position_id = position.id, error = %e, "래더 배치 실패, 포지션 정리");
                let current = self.ctx.ledger.get_position(position.id).await?;
                if let Err(unwind) = self.flatten(exchange, &current).await {
                    error!(position_id = position.id, error = %unwind, "포지션 정리 실패");
                }
                if let Err(comment) = self
                    .ctx
                    .ledger
                    .append_position_comment(position.id, &format!("unwound: {}", e))
                    .await
                {
                    warn!(position_id = position.id, error = %comment, "감사 로그 기록 실패");
                }
                Err(e)
            }
        }
    }
}

/// 시장가 반대 주문으로 진입분을 되돌림 (실패는 로그만).
async fn reverse_fill(
    exchange: &dyn FuturesExchange,
    instrument: Instrument,
    direction: Direction,
    quantity: Decimal,
) {
    if quantity <= Decimal::ZERO {
        return;
    }
    match exchange
        .place_market_order(instrument, quantity, direction.close_side())
        .await
    {
        Ok(order_id) => info!(%order_id, %direction, %quantity, "진입 주문 되돌림"),
        Err(e) => error!(%direction, %quantity, error = %e, "진입 주문 되돌림 실패"),
    }
}
