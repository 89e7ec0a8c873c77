//! 주문 모니터 통합 테스트
//!
//! ## 테스트 검증 항목
//! 1. 손절 발동 → 보호 주문 전부 비활성, 포지션 종료, 수량은 한 번만 차감
//! 2. 익절 캐스케이드 (남은 개수 기준): 3개 → 반영만, 2개 → 손절 현재가 이동, 1개 → 종료
//! 3. 본전 이동은 모니터 수명 동안 1회, 같은 가격 재적용은 no-op,
//!    이동하려던 손절이 이미 발동했으면 본전 이동 기록 없음
//! 4. 상태 채널 `Changing` 동안 사이클 건너뜀, 이후 같은 결과로 수렴
//! 5. 정합성 위반은 치명 에러, 다른 포지션 모니터에 영향 없음

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Harness;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;
use trader_core::domain::{
    ApiCredentials, Direction, FillDetail, FuturesExchange, Instrument, NewPosition,
    NewSltpOrder, OrderSide, OrderStatus, PlanType, PositionLedger, PositionStatus,
    ProtectiveOrderStatus, ProviderError, RecordState, SltpOrder, StatusChannel,
};
use trader_exchange::MockExchangeProvider;
use trader_execution::{
    DispatchOutcome, ExecutionError, FinishReason, OrderMonitor, PollOutcome, ProbeResult,
};

async fn open(h: &Harness, direction: Direction) -> i64 {
    match h
        .dispatcher
        .dispatch(h.trader.id, direction, false)
        .await
        .unwrap()
    {
        DispatchOutcome::Opened { position_id } => position_id,
        other => panic!("expected Opened, got {:?}", other),
    }
}

/// 진입가에서 가까운 순으로 정렬된 Active 익절.
async fn take_profits(h: &Harness, position_id: i64, direction: Direction) -> Vec<SltpOrder> {
    let (_, mut tps) = h.active_orders(position_id).await;
    tps.sort_by_key(|o| o.trigger_price);
    if direction == Direction::Short {
        tps.reverse();
    }
    tps
}

async fn stop_loss(h: &Harness, position_id: i64) -> SltpOrder {
    let (mut sls, _) = h.active_orders(position_id).await;
    assert_eq!(sls.len(), 1);
    sls.remove(0)
}

// ============================================================================
// 손절
// ============================================================================

#[tokio::test]
async fn stop_loss_trigger_closes_position_once() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;
    let sl = stop_loss(&h, position_id).await;
    let tps = take_profits(&h, position_id, Direction::Long).await;

    h.exchange.set_mark_price(dec!(59650)).await;
    assert!(h.exchange.trigger_plan_order(&sl.remote_id).await);

    let mut monitor = h.monitor(position_id);
    let outcome = monitor.poll_once().await.unwrap();
    assert_eq!(outcome, PollOutcome::Finished(FinishReason::StopLossTriggered));

    let position = h.ledger.get_position(position_id).await.unwrap();
    assert_eq!(position.state, RecordState::Inactive);
    assert_eq!(position.quantity, Decimal::ZERO);
    assert!(h.ledger.active_sltp_orders(position_id).await.unwrap().is_empty());
    for tp in &tps {
        assert!(!h.exchange.plan_order(&tp.remote_id).await.unwrap().live);
    }
    h.assert_history_matches(position_id).await;

    // 다시 돌려도 수량은 그대로
    let again = monitor.poll_once().await.unwrap();
    assert_eq!(again, PollOutcome::Finished(FinishReason::PositionInactive));
    let position = h.ledger.get_position(position_id).await.unwrap();
    assert_eq!(position.quantity, Decimal::ZERO);
    assert_eq!(h.ledger.position_actions(position_id).await.unwrap().len(), 2);
}

// ============================================================================
// 익절 캐스케이드
// ============================================================================

#[tokio::test]
async fn second_take_profit_snaps_stop_loss_to_mark() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;
    let tps = take_profits(&h, position_id, Direction::Long).await;
    let sl = stop_loss(&h, position_id).await;
    let mut monitor = h.monitor(position_id);

    // 첫 익절: 자기 자신만 반영 (본전 이동은 가격 조건으로 함께 일어남)
    h.exchange.set_mark_price(dec!(60650)).await;
    assert!(h.exchange.trigger_plan_order(&tps[0].remote_id).await);
    assert_eq!(monitor.poll_once().await.unwrap(), PollOutcome::Continue);

    let position = h.ledger.get_position(position_id).await.unwrap();
    assert_eq!(position.quantity, dec!(0.002));
    assert_eq!(
        h.ledger.get_sltp_order(sl.id).await.unwrap().trigger_price,
        dec!(60000)
    );

    // 두 번째 익절: 손절을 현재가로
    h.exchange.set_mark_price(dec!(61300)).await;
    assert!(h.exchange.trigger_plan_order(&tps[1].remote_id).await);
    assert_eq!(monitor.poll_once().await.unwrap(), PollOutcome::Continue);

    let position = h.ledger.get_position(position_id).await.unwrap();
    assert_eq!(position.state, RecordState::Active);
    assert_eq!(position.quantity, dec!(0.001));
    assert_eq!(
        h.ledger.get_sltp_order(tps[1].id).await.unwrap().state,
        RecordState::Inactive
    );
    let sl = h.ledger.get_sltp_order(sl.id).await.unwrap();
    assert_eq!(sl.trigger_price, dec!(61300));
    assert_eq!(
        h.exchange.plan_order(&sl.remote_id).await.unwrap().trigger_price,
        dec!(61300)
    );
    h.assert_history_matches(position_id).await;
}

#[tokio::test]
async fn last_take_profit_closes_position() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Short).await;
    let tps = take_profits(&h, position_id, Direction::Short).await;
    let sl = stop_loss(&h, position_id).await;
    let mut monitor = h.monitor(position_id);

    h.exchange.set_mark_price(dec!(58100)).await;
    for tp in &tps {
        assert!(h.exchange.trigger_plan_order(&tp.remote_id).await);
    }

    let outcome = monitor.poll_once().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Finished(FinishReason::TakeProfitsExhausted)
    );

    let position = h.ledger.get_position(position_id).await.unwrap();
    assert_eq!(position.state, RecordState::Inactive);
    assert_eq!(position.quantity, Decimal::ZERO);
    assert!(h.ledger.active_sltp_orders(position_id).await.unwrap().is_empty());
    assert!(!h.exchange.plan_order(&sl.remote_id).await.unwrap().live);
    // 신규 진입 래더는 전량을 익절에 배정하므로 남은 수량 청산 주문이 없음
    assert_eq!(h.exchange.market_orders().await.len(), 1);
    h.assert_history_matches(position_id).await;
}

#[tokio::test]
async fn expanded_position_closes_reserve_on_last_take_profit() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;
    h.exchange.set_mark_price(dec!(60600)).await;
    h.dispatcher
        .dispatch(h.trader.id, Direction::Long, false)
        .await
        .unwrap();

    let tps = take_profits(&h, position_id, Direction::Long).await;
    let reserved: Decimal =
        dec!(0.006) - tps.iter().map(|o| o.quantity).sum::<Decimal>();
    assert_eq!(reserved, dec!(0.001));

    h.exchange.set_mark_price(dec!(62200)).await;
    for tp in &tps {
        assert!(h.exchange.trigger_plan_order(&tp.remote_id).await);
    }

    let mut monitor = h.monitor(position_id);
    assert_eq!(
        monitor.poll_once().await.unwrap(),
        PollOutcome::Finished(FinishReason::TakeProfitsExhausted)
    );

    let position = h.ledger.get_position(position_id).await.unwrap();
    assert_eq!(position.state, RecordState::Inactive);
    assert_eq!(position.quantity, Decimal::ZERO);
    let market = h.exchange.market_orders().await;
    assert_eq!(market.len(), 3);
    assert_eq!(market[2].quantity, dec!(0.001));
    assert_eq!(h.exchange.exposure(Direction::Long).await, Decimal::ZERO);
    assert!(h.exchange.live_plan_orders().await.is_empty());
    h.assert_history_matches(position_id).await;
}

#[tokio::test]
async fn take_profit_count_never_increases() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;
    let tps = take_profits(&h, position_id, Direction::Long).await;
    let mut monitor = h.monitor(position_id);

    let mut last = tps.len();
    for tp in &tps[..2] {
        h.exchange.trigger_plan_order(&tp.remote_id).await;
        monitor.poll_once().await.unwrap();
        let (sls, current) = h.active_orders(position_id).await;
        assert_eq!(sls.len(), 1);
        assert!(current.len() < last);
        last = current.len();
    }
    assert_eq!(last, 1);
}

// ============================================================================
// 본전 이동
// ============================================================================

#[tokio::test]
async fn trailing_applies_once_and_is_idempotent() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;
    let sl = stop_loss(&h, position_id).await;
    let mut monitor = h.monitor(position_id);

    // 60000 × 1.0038 = 60228 미만이면 그대로
    h.exchange.set_mark_price(dec!(60200)).await;
    monitor.poll_once().await.unwrap();
    assert!(!monitor.has_trailed());
    assert_eq!(
        h.ledger.get_sltp_order(sl.id).await.unwrap().trigger_price,
        dec!(59700)
    );

    h.exchange.set_mark_price(dec!(60300)).await;
    monitor.poll_once().await.unwrap();
    assert!(monitor.has_trailed());
    assert_eq!(
        h.ledger.get_sltp_order(sl.id).await.unwrap().trigger_price,
        dec!(60000)
    );

    let calls = h.exchange.modify_calls().await;
    assert!(!monitor.adjust_stop_loss(sl.id, dec!(60000)).await.unwrap());
    assert_eq!(h.exchange.modify_calls().await, calls);

    monitor.poll_once().await.unwrap();
    let position = h.ledger.get_position(position_id).await.unwrap();
    assert_eq!(position.trace.matches("break-even").count(), 1);
}

/// 손절 가격을 옮기려는 순간 손절이 발동하는 거래소.
struct StopFiresOnMove {
    inner: MockExchangeProvider,
}

#[async_trait]
impl FuturesExchange for StopFiresOnMove {
    async fn place_market_order(
        &self,
        instrument: Instrument,
        quantity: Decimal,
        side: OrderSide,
    ) -> Result<String, ProviderError> {
        self.inner.place_market_order(instrument, quantity, side).await
    }

    async fn place_limit_order(
        &self,
        instrument: Instrument,
        quantity: Decimal,
        side: OrderSide,
        price: Decimal,
    ) -> Result<String, ProviderError> {
        self.inner.place_limit_order(instrument, quantity, side, price).await
    }

    async fn cancel_order(
        &self,
        instrument: Instrument,
        order_id: &str,
    ) -> Result<(), ProviderError> {
        self.inner.cancel_order(instrument, order_id).await
    }

    async fn place_protective_order(
        &self,
        instrument: Instrument,
        plan_type: PlanType,
        trigger_price: Decimal,
        hold_side: Direction,
        quantity: Decimal,
    ) -> Result<String, ProviderError> {
        self.inner
            .place_protective_order(instrument, plan_type, trigger_price, hold_side, quantity)
            .await
    }

    async fn modify_protective_order(
        &self,
        order: &SltpOrder,
        trigger_price: Decimal,
    ) -> Result<ProtectiveOrderStatus, ProviderError> {
        if order.is_stop_loss() && trigger_price != order.trigger_price {
            self.inner.trigger_plan_order(&order.remote_id).await;
        }
        self.inner.modify_protective_order(order, trigger_price).await
    }

    async fn cancel_protective_order(&self, order: &SltpOrder) -> Result<(), ProviderError> {
        self.inner.cancel_protective_order(order).await
    }

    async fn query_fill(
        &self,
        instrument: Instrument,
        order_id: &str,
    ) -> Result<FillDetail, ProviderError> {
        self.inner.query_fill(instrument, order_id).await
    }

    async fn query_order_state(
        &self,
        instrument: Instrument,
        order_id: &str,
    ) -> Result<Option<OrderStatus>, ProviderError> {
        self.inner.query_order_state(instrument, order_id).await
    }

    async fn get_mark_price(&self, instrument: Instrument) -> Result<Decimal, ProviderError> {
        self.inner.get_mark_price(instrument).await
    }

    fn exchange_name(&self) -> &str {
        "stop-fires-on-move"
    }
}

#[tokio::test]
async fn trailing_onto_a_fired_stop_leaves_no_break_even_comment() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;
    let sl = stop_loss(&h, position_id).await;
    let exchange = StopFiresOnMove {
        inner: h.exchange.clone(),
    };
    let mut monitor = OrderMonitor::new(h.ctx.clone(), Arc::new(exchange), position_id);

    h.exchange.set_mark_price(dec!(60300)).await;
    assert_eq!(monitor.poll_once().await.unwrap(), PollOutcome::Continue);

    let position = h.ledger.get_position(position_id).await.unwrap();
    assert!(!position.trace.contains("break-even"));
    assert_eq!(
        h.ledger.get_sltp_order(sl.id).await.unwrap().trigger_price,
        dec!(59700)
    );

    // 다음 사이클에서 발동한 손절로 종료
    assert_eq!(
        monitor.poll_once().await.unwrap(),
        PollOutcome::Finished(FinishReason::StopLossTriggered)
    );
    let position = h.ledger.get_position(position_id).await.unwrap();
    assert_eq!(position.state, RecordState::Inactive);
    assert!(!position.trace.contains("break-even"));
}

#[tokio::test]
async fn short_trailing_threshold() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Short).await;
    let sl = stop_loss(&h, position_id).await;
    let mut monitor = h.monitor(position_id);

    // 60000 × 0.9938 = 59628
    h.exchange.set_mark_price(dec!(59700)).await;
    monitor.poll_once().await.unwrap();
    assert!(!monitor.has_trailed());

    h.exchange.set_mark_price(dec!(59600)).await;
    monitor.poll_once().await.unwrap();
    assert!(monitor.has_trailed());
    assert_eq!(
        h.ledger.get_sltp_order(sl.id).await.unwrap().trigger_price,
        dec!(60000)
    );
}

// ============================================================================
// 상태 채널 / 일시적 에러
// ============================================================================

#[tokio::test]
async fn changing_status_skips_cycle_then_converges() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;
    let tps = take_profits(&h, position_id, Direction::Long).await;
    let mut monitor = h.monitor(position_id);

    h.exchange.trigger_plan_order(&tps[0].remote_id).await;
    h.status.publish(position_id, PositionStatus::Changing).await;
    let calls = h.exchange.modify_calls().await;

    assert_eq!(monitor.poll_once().await.unwrap(), PollOutcome::Skipped);
    assert_eq!(monitor.poll_once().await.unwrap(), PollOutcome::Skipped);
    assert_eq!(h.exchange.modify_calls().await, calls);
    assert_eq!(
        h.ledger.get_position(position_id).await.unwrap().quantity,
        dec!(0.003)
    );

    h.status.publish(position_id, PositionStatus::Finished).await;
    assert_eq!(monitor.poll_once().await.unwrap(), PollOutcome::Continue);
    assert_eq!(
        h.ledger.get_position(position_id).await.unwrap().quantity,
        dec!(0.002)
    );
}

#[tokio::test]
async fn probe_errors_are_tolerated() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;
    let sl = stop_loss(&h, position_id).await;
    let monitor = h.monitor(position_id);

    h.exchange.fail_next_modifications(1).await;
    assert_eq!(monitor.probe(&sl).await.unwrap(), ProbeResult::NotTriggered);
    assert_eq!(
        h.ledger.get_sltp_order(sl.id).await.unwrap().state,
        RecordState::Active
    );
}

#[tokio::test]
async fn probe_of_stale_order_reports_not_triggered() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;
    let tps = take_profits(&h, position_id, Direction::Long).await;
    let monitor = h.monitor(position_id);

    h.ledger.inactivate_sltp_order(tps[2].id).await.unwrap();
    h.exchange.trigger_plan_order(&tps[2].remote_id).await;
    let calls = h.exchange.modify_calls().await;

    assert_eq!(
        monitor.probe(&tps[2]).await.unwrap(),
        ProbeResult::NotTriggered
    );
    assert_eq!(h.exchange.modify_calls().await, calls);
}

// ============================================================================
// 정합성 위반 / 태스크 격리
// ============================================================================

/// 손절 없이 익절만 있는 포지션 (손상된 원장 재현).
async fn corrupt_position(h: &Harness, trader_id: i64) -> i64 {
    let position = h
        .ledger
        .create_position(NewPosition {
            trader_id,
            instrument: Instrument::BtcFutures,
            direction: Direction::Long,
            quantity: dec!(0.003),
        })
        .await
        .unwrap();
    h.ledger
        .create_sltp_order(NewSltpOrder {
            position_id: position.id,
            trader_id,
            instrument: Instrument::BtcFutures,
            plan_type: PlanType::TakeProfit,
            trigger_price: dec!(60600),
            quantity: dec!(0.003),
            remote_id: "orphan-tp".to_string(),
        })
        .await
        .unwrap();
    position.id
}

#[tokio::test]
async fn missing_stop_loss_is_fatal() {
    let h = Harness::with_manual_monitor().await;
    let position_id = corrupt_position(&h, h.trader.id).await;

    let err = h.monitor(position_id).poll_once().await.unwrap_err();
    assert!(matches!(err, ExecutionError::Consistency(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn missing_take_profits_is_fatal() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;
    for tp in take_profits(&h, position_id, Direction::Long).await {
        h.ledger.inactivate_sltp_order(tp.id).await.unwrap();
    }

    let err = h.monitor(position_id).poll_once().await.unwrap_err();
    assert!(matches!(err, ExecutionError::Invariant { .. }));
}

#[tokio::test]
async fn failing_monitor_does_not_affect_others() {
    let h = Harness::with_manual_monitor().await;
    let healthy = open(&h, Direction::Long).await;
    let bob = h
        .ledger
        .insert_trader("bob", ApiCredentials::new("k2", "s2", "p2"))
        .await;
    let broken = corrupt_position(&h, bob.id).await;

    let shutdown = CancellationToken::new();
    let broken_task = tokio::spawn(h.monitor(broken).run(shutdown.clone()));
    let healthy_task = tokio::spawn(h.monitor(healthy).run(shutdown.clone()));

    let broken_result = broken_task.await.unwrap();
    assert!(matches!(broken_result, Err(ExecutionError::Consistency(_))));

    let sl = stop_loss(&h, healthy).await;
    h.exchange.trigger_plan_order(&sl.remote_id).await;
    let healthy_result = tokio::time::timeout(Duration::from_secs(5), healthy_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(healthy_result.unwrap(), FinishReason::StopLossTriggered);
}

#[tokio::test]
async fn shutdown_stops_monitor() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(h.monitor(position_id).run(shutdown.clone()));
    tokio::task::yield_now().await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap(), FinishReason::Shutdown);
    assert_eq!(
        h.ledger.get_position(position_id).await.unwrap().state,
        RecordState::Active
    );
}

// ============================================================================
// 레지스트리
// ============================================================================

#[tokio::test]
async fn registry_runs_one_monitor_per_position() {
    let h = Harness::new().await;
    let position_id = open(&h, Direction::Long).await;
    let registry = Arc::clone(h.dispatcher.monitors());

    assert!(registry.is_running(position_id));
    assert!(registry.ensure_running(position_id).is_none());

    let sl = stop_loss(&h, position_id).await;
    h.exchange.trigger_plan_order(&sl.remote_id).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.is_running(position_id) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let position = h.ledger.get_position(position_id).await.unwrap();
    assert_eq!(position.state, RecordState::Inactive);
    h.shutdown.cancel();
}

#[tokio::test]
async fn resume_starts_monitors_for_active_positions() {
    let h = Harness::with_manual_monitor().await;
    let position_id = open(&h, Direction::Long).await;

    let registry = trader_execution::MonitorRegistry::new(h.ctx.clone(), CancellationToken::new());
    assert_eq!(registry.resume_active().await.unwrap(), 1);
    assert!(registry.is_running(position_id));
    assert_eq!(registry.resume_active().await.unwrap(), 0);
}
