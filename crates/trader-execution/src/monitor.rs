//! 포지션별 보호 주문 모니터.
//!
//! 포지션마다 하나의 백그라운드 태스크가 일정 주기로 손절/익절 주문의
//! 발동 여부를 확인하고 원장에 반영합니다.
//!
//! # 폴링 사이클
//!
//! 1. 포지션이 Inactive 이거나 Active 보호 주문이 없으면 종료
//! 2. Active 손절은 정확히 1개 (아니면 정합성 위반으로 종료)
//! 3. 손절 확인. 발동했으면 포지션 전체 종료
//! 4. 가격이 충분히 유리하면 손절을 본전으로 이동 (모니터 수명 동안 1회)
//! 5. 익절을 진입가에서 가까운 순으로 확인하고, 남은 Active 익절 개수에 따라 처리
//!    - 3개: 발동한 익절만 반영
//!    - 2개: 손절을 현재가로 옮기고 반영
//!    - 1개: 포지션 전체 종료
//! 6. 대기 후 반복
//!
//! 주문 확인은 같은 가격으로 정정 요청을 보내 주문이 살아있는지 보는 방식입니다.
//! 상태 채널이 `Changing`이면 거래소를 건드리지 않고 사이클을 건너뜁니다.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use trader_core::domain::{
    average_entry_price, FuturesExchange, Position, ProtectiveOrderStatus, RecordState,
    SltpOrder,
};
use trader_core::policy;

use crate::context::ExecutionContext;
use crate::error::{ExecutionError, ExecutionResult};
use crate::ladder::{
    cancel_on_exchange, round_trigger, sort_by_proximity, tightens, trail_threshold_reached,
};
use crate::orders::submit_order;
use crate::reconciliation::reconcile_fills;

// =============================================================================
// 시계
// =============================================================================

/// 폴링 대기 추상화.
#[async_trait]
pub trait MonitorClock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// `tokio::time::sleep` 기반 시계.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl MonitorClock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// =============================================================================
// 결과 타입
// =============================================================================

/// 보호 주문 1건의 확인 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// 거래소에 주문이 없음 (발동됨)
    Triggered,
    /// 아직 살아있거나, 원장에서 이미 비활성이거나, 일시적 에러
    NotTriggered,
    /// 변경 진행 중이라 확인하지 않음
    Skipped,
}

/// 폴링 사이클 1회 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// 다음 사이클 계속
    Continue,
    /// 변경 진행 중이라 이번 사이클 건너뜀
    Skipped,
    /// 모니터 종료
    Finished(FinishReason),
}

/// 모니터 종료 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// 포지션이 이미 Inactive
    PositionInactive,
    /// Active 보호 주문 없음
    LadderEmpty,
    /// 손절 발동
    StopLossTriggered,
    /// 마지막 익절 발동
    TakeProfitsExhausted,
    /// 프로세스 종료
    Shutdown,
}

// =============================================================================
// OrderMonitor
// =============================================================================

/// 포지션 1개의 보호 주문 모니터.
pub struct OrderMonitor {
    ctx: ExecutionContext,
    exchange: Arc<dyn FuturesExchange>,
    position_id: i64,
    /// 본전 이동을 이미 했는지
    trailed: bool,
}

impl OrderMonitor {
    pub fn new(ctx: ExecutionContext, exchange: Arc<dyn FuturesExchange>, position_id: i64) -> Self {
        Self {
            ctx,
            exchange,
            position_id,
            trailed: false,
        }
    }

    /// 포지션의 트레이더로부터 거래소 클라이언트를 만들어 생성.
    pub async fn for_position(ctx: ExecutionContext, position_id: i64) -> ExecutionResult<Self> {
        let position = ctx.ledger.get_position(position_id).await?;
        let (_, exchange) = ctx.trader_exchange(position.trader_id).await?;
        Ok(Self::new(ctx, exchange, position_id))
    }

    pub fn position_id(&self) -> i64 {
        self.position_id
    }

    pub fn has_trailed(&self) -> bool {
        self.trailed
    }

    /// 종료 조건까지 폴링.
    ///
    /// 일시적 에러는 로그만 남기고 다음 사이클로 넘어갑니다.
    /// 정합성 위반/불변식 위반은 그대로 반환합니다.
    pub async fn run(mut self, shutdown: CancellationToken) -> ExecutionResult<FinishReason> {
        let position_id = self.position_id;
        let interval = self.ctx.config.monitor_interval;
        info!(position_id, ?interval, "주문 모니터 시작");

        loop {
            if shutdown.is_cancelled() {
                return Ok(FinishReason::Shutdown);
            }
            match self.poll_once().await {
                Ok(PollOutcome::Finished(reason)) => {
                    info!(position_id, ?reason, "주문 모니터 종료");
                    return Ok(reason);
                }
                Ok(PollOutcome::Skipped) => debug!(position_id, "변경 진행 중, 사이클 건너뜀"),
                Ok(PollOutcome::Continue) => {}
                Err(e) if e.is_fatal() => {
                    error!(position_id, error = %e, "주문 모니터 비정상 종료");
                    return Err(e);
                }
                Err(e) => warn!(position_id, error = %e, "폴링 사이클 실패, 다음 주기에 재시도"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(position_id, "종료 신호로 주문 모니터 중단");
                    return Ok(FinishReason::Shutdown);
                }
                _ = self.ctx.clock.sleep(interval) => {}
            }
        }
    }

    /// 폴링 사이클 1회.
    #[instrument(skip(self), fields(position_id = self.position_id))]
    pub async fn poll_once(&mut self) -> ExecutionResult<PollOutcome> {
        let position = self.ctx.ledger.get_position(self.position_id).await?;
        if !position.is_active() {
            return Ok(PollOutcome::Finished(FinishReason::PositionInactive));
        }

        let orders = self.ctx.ledger.active_sltp_orders(self.position_id).await?;
        if orders.is_empty() {
            return Ok(PollOutcome::Finished(FinishReason::LadderEmpty));
        }

        let (stop_losses, mut take_profits): (Vec<_>, Vec<_>) =
            orders.into_iter().partition(|o| o.is_stop_loss());
        let stop_loss = match stop_losses.as_slice() {
            [sl] => sl.clone(),
            _ => {
                return Err(ExecutionError::Consistency(format!(
                    "position #{} has {} active stop-loss orders",
                    self.position_id,
                    stop_losses.len()
                )))
            }
        };

        match self.probe(&stop_loss).await? {
            ProbeResult::Skipped => return Ok(PollOutcome::Skipped),
            ProbeResult::Triggered => {
                self.handle_stop_loss(&stop_loss).await?;
                return Ok(PollOutcome::Finished(FinishReason::StopLossTriggered));
            }
            ProbeResult::NotTriggered => {}
        }

        if let Err(e) = self.maybe_trail(&position).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(position_id = self.position_id, error = %e, "손절 본전 이동 실패");
        }

        if take_profits.is_empty() {
            return Err(ExecutionError::Invariant {
                position_id: self.position_id,
                reason: "no active take-profit while position is open".to_string(),
            });
        }
        if take_profits.len() > policy::MAX_TAKE_PROFITS {
            return Err(ExecutionError::Consistency(format!(
                "position #{} has {} active take-profit orders",
                self.position_id,
                take_profits.len()
            )));
        }
        sort_by_proximity(position.direction, &mut take_profits);

        let mut remaining = take_profits.len();
        for take_profit in &take_profits {
            match self.probe(take_profit).await? {
                ProbeResult::Skipped => return Ok(PollOutcome::Skipped),
                ProbeResult::NotTriggered => continue,
                ProbeResult::Triggered => {}
            }

            match remaining {
                1 => {
                    self.close_on_last_take_profit(take_profit, &stop_loss).await?;
                    return Ok(PollOutcome::Finished(FinishReason::TakeProfitsExhausted));
                }
                2 => {
                    self.snap_stop_loss_to_mark(&position, &stop_loss).await;
                    self.record_take_profit(take_profit, remaining).await?;
                }
                _ => self.record_take_profit(take_profit, remaining).await?,
            }
            remaining -= 1;
        }

        Ok(PollOutcome::Continue)
    }

    /// 보호 주문이 아직 살아있는지 확인.
    pub async fn probe(&self, order: &SltpOrder) -> ExecutionResult<ProbeResult> {
        if self.ctx.status.is_changing(self.position_id).await {
            return Ok(ProbeResult::Skipped);
        }

        let fresh = self.ctx.ledger.get_sltp_order(order.id).await?;
        if !fresh.is_active() {
            return Ok(ProbeResult::NotTriggered);
        }

        match self
            .exchange
            .modify_protective_order(&fresh, fresh.trigger_price)
            .await
        {
            Ok(ProtectiveOrderStatus::Triggered) => {
                info!(
                    position_id = self.position_id,
                    order_id = fresh.id,
                    plan_type = %fresh.plan_type,
                    trigger_price = %fresh.trigger_price,
                    "보호 주문 발동 확인"
                );
                Ok(ProbeResult::Triggered)
            }
            Ok(ProtectiveOrderStatus::Confirmed) => Ok(ProbeResult::NotTriggered),
            Err(e) => {
                warn!(
                    position_id = self.position_id,
                    order_id = fresh.id,
                    error = %e,
                    "보호 주문 확인 실패, 미발동으로 간주"
                );
                Ok(ProbeResult::NotTriggered)
            }
        }
    }

    /// 손절을 새 가격으로 옮김.
    ///
    /// 주문이 이미 비활성이거나 같은 가격이면 아무것도 하지 않고 `false`를 반환합니다.
    /// 거래소에서 이미 발동된 경우도 `false`이며 다음 확인에서 처리됩니다.
    pub async fn adjust_stop_loss(
        &self,
        stop_loss_id: i64,
        trigger_price: Decimal,
    ) -> ExecutionResult<bool> {
        let order = self.ctx.ledger.get_sltp_order(stop_loss_id).await?;
        if !order.is_active() || order.trigger_price == trigger_price {
            return Ok(false);
        }

        match self
            .exchange
            .modify_protective_order(&order, trigger_price)
            .await?
        {
            ProtectiveOrderStatus::Confirmed => {
                self.ctx
                    .ledger
                    .update_trigger_price(order.id, trigger_price)
                    .await?;
                info!(
                    position_id = self.position_id,
                    order_id = order.id,
                    from = %order.trigger_price,
                    to = %trigger_price,
                    "손절 가격 변경"
                );
                Ok(true)
            }
            ProtectiveOrderStatus::Triggered => Ok(false),
        }
    }

    /// 가격이 임계값을 넘으면 손절을 본전(평균 진입가)으로 이동. 모니터 수명 동안 1회.
    async fn maybe_trail(&mut self, position: &Position) -> ExecutionResult<()> {
        if self.trailed {
            return Ok(());
        }

        let actions = self.ctx.ledger.position_actions(self.position_id).await?;
        let Some(entry) = average_entry_price(&actions) else {
            return Ok(());
        };
        let mark = self.exchange.get_mark_price(position.instrument).await?;
        if !trail_threshold_reached(position.direction, entry, mark) {
            return Ok(());
        }

        let target = round_trigger(entry);
        let orders = self.ctx.ledger.active_sltp_orders(self.position_id).await?;
        let Some(stop_loss) = orders.iter().find(|o| o.is_stop_loss()) else {
            return Ok(());
        };
        // 거래소에서 이미 발동했으면 다음 사이클의 손절 확인이 처리
        if tightens(position.direction, stop_loss.trigger_price, target)
            && self.adjust_stop_loss(stop_loss.id, target).await?
        {
            self.ctx
                .ledger
                .append_position_comment(
                    self.position_id,
                    &format!("stop-loss trailed to break-even {} (mark {})", target, mark),
                )
                .await?;
        }
        self.trailed = true;
        Ok(())
    }

    /// 손절 발동: 남은 보호 주문 전부 비활성화, 포지션 종료.
    async fn handle_stop_loss(&self, stop_loss: &SltpOrder) -> ExecutionResult<()> {
        let leftovers: Vec<SltpOrder> = self
            .ctx
            .ledger
            .active_sltp_orders(self.position_id)
            .await?
            .into_iter()
            .filter(|o| o.id != stop_loss.id)
            .collect();

        let position = self
            .ctx
            .ledger
            .apply_protective_fill(
                self.position_id,
                stop_loss.id,
                true,
                "quantity decreased due to stop loss",
            )
            .await?;
        cancel_on_exchange(self.exchange.as_ref(), &leftovers).await;
        info!(
            position_id = self.position_id,
            quantity = %position.quantity,
            "손절 발동으로 포지션 종료"
        );
        Ok(())
    }

    /// 익절 1건 반영.
    async fn record_take_profit(
        &self,
        take_profit: &SltpOrder,
        remaining: usize,
    ) -> ExecutionResult<()> {
        let position = self
            .ctx
            .ledger
            .apply_protective_fill(
                self.position_id,
                take_profit.id,
                false,
                &format!("quantity decreased due to take profit ({} active)", remaining),
            )
            .await?;
        info!(
            position_id = self.position_id,
            order_id = take_profit.id,
            quantity = %position.quantity,
            remaining = remaining - 1,
            "익절 반영"
        );
        Ok(())
    }

    /// 손절을 현재 마크 가격으로 이동 (손실 축소 방향일 때만). 실패는 로그만.
    async fn snap_stop_loss_to_mark(&self, position: &Position, stop_loss: &SltpOrder) {
        if let Err(e) = self.try_snap_stop_loss(position, stop_loss).await {
            warn!(position_id = self.position_id, error = %e, "손절 현재가 이동 실패");
        }
    }

    async fn try_snap_stop_loss(
        &self,
        position: &Position,
        stop_loss: &SltpOrder,
    ) -> ExecutionResult<()> {
        let mark = round_trigger(self.exchange.get_mark_price(position.instrument).await?);
        let current = self.ctx.ledger.get_sltp_order(stop_loss.id).await?;
        if !tightens(position.direction, current.trigger_price, mark) {
            debug!(position_id = self.position_id, %mark, "현재가가 손절을 좁히지 않음, 유지");
            return Ok(());
        }
        if self.adjust_stop_loss(stop_loss.id, mark).await? {
            self.ctx
                .ledger
                .append_position_comment(
                    self.position_id,
                    &format!("stop-loss snapped to mark {}", mark),
                )
                .await?;
        }
        Ok(())
    }

    /// 마지막 익절 발동: 익절 반영, 남은 수량 시장가 청산, 남은 보호 주문 취소, 포지션 종료.
    async fn close_on_last_take_profit(
        &self,
        take_profit: &SltpOrder,
        stop_loss: &SltpOrder,
    ) -> ExecutionResult<()> {
        let mut position = self
            .ctx
            .ledger
            .apply_protective_fill(
                self.position_id,
                take_profit.id,
                false,
                "quantity decreased due to last take profit",
            )
            .await?;

        if position.is_active() && position.quantity > Decimal::ZERO {
            let order_ids = submit_order(
                self.exchange.as_ref(),
                &self.ctx.config,
                position.instrument,
                position.quantity,
                position.direction.close_side(),
            )
            .await?;
            position = reconcile_fills(
                self.ctx.ledger.as_ref(),
                self.exchange.as_ref(),
                &self.ctx.config.fill_retry,
                self.position_id,
                position.instrument,
                &order_ids,
            )
            .await?;
        }

        // 수량이 0 이 되면 원장에서는 이미 비활성이지만 거래소의 손절은 살아있음
        let mut leftovers = self.ctx.ledger.active_sltp_orders(self.position_id).await?;
        if !leftovers.iter().any(|o| o.id == stop_loss.id) {
            leftovers.push(stop_loss.clone());
        }
        cancel_on_exchange(self.exchange.as_ref(), &leftovers).await;
        self.ctx
            .ledger
            .inactivate_all_sltp_orders(self.position_id)
            .await?;

        if position.is_active() {
            self.ctx
                .ledger
                .set_position_state(self.position_id, RecordState::Inactive)
                .await?;
        }
        self.ctx
            .ledger
            .append_position_comment(self.position_id, "position closed by last take profit")
            .await?;
        info!(position_id = self.position_id, "마지막 익절로 포지션 종료");
        Ok(())
    }
}

// =============================================================================
// MonitorRegistry
// =============================================================================

/// 프로세스 내 모니터 태스크 관리 (포지션당 최대 1개).
pub struct MonitorRegistry {
    ctx: ExecutionContext,
    running: Arc<Mutex<HashSet<i64>>>,
    shutdown: CancellationToken,
}

impl MonitorRegistry {
    pub fn new(ctx: ExecutionContext, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            running: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    /// 포지션 모니터가 돌고 있지 않으면 시작. 새로 시작했으면 핸들 반환.
    pub fn ensure_running(
        &self,
        position_id: i64,
    ) -> Option<JoinHandle<ExecutionResult<FinishReason>>> {
        {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if !running.insert(position_id) {
                debug!(position_id, "주문 모니터 이미 실행 중");
                return None;
            }
        }

        let ctx = self.ctx.clone();
        let running = Arc::clone(&self.running);
        let shutdown = self.shutdown.child_token();
        Some(tokio::spawn(async move {
            let result = match OrderMonitor::for_position(ctx, position_id).await {
                Ok(monitor) => monitor.run(shutdown).await,
                Err(e) => {
                    error!(position_id, error = %e, "주문 모니터 생성 실패");
                    Err(e)
                }
            };
            running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&position_id);
            result
        }))
    }

    pub fn is_running(&self, position_id: i64) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&position_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 모든 Active 포지션의 모니터 재개 (프로세스 기동 시).
    pub async fn resume_active(&self) -> ExecutionResult<usize> {
        let positions = self.ctx.ledger.all_active_positions().await?;
        let started = positions
            .iter()
            .filter(|p| self.ensure_running(p.id).is_some())
            .count();
        info!(active = positions.len(), started, "주문 모니터 재개");
        Ok(started)
    }
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("running", &self.running_count())
            .finish_non_exhaustive()
    }
}
