//! 통합 테스트 공용 구성.
//!
//! 메모리 원장 + 메모리 상태 채널 + Mock 거래소로 실행 컨텍스트를 만듭니다.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;
use trader_core::domain::{
    net_quantity, ApiCredentials, InMemoryStatusChannel, PlanType, PositionLedger, SltpOrder,
    Trader,
};
use trader_data::MemoryLedger;
use trader_exchange::MockExchangeProvider;
use trader_execution::{
    ExecutionConfig, ExecutionContext, MonitorClock, MonitorRegistry, OrderMonitor,
    SignalDispatcher,
};

pub const ENTRY: Decimal = dec!(60000);

/// 대기 없이 바로 다음 사이클로 넘어가는 시계.
pub struct ImmediateClock;

#[async_trait]
impl MonitorClock for ImmediateClock {
    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub status: Arc<InMemoryStatusChannel>,
    pub exchange: MockExchangeProvider,
    pub ctx: ExecutionContext,
    pub dispatcher: SignalDispatcher,
    pub trader: Trader,
    pub shutdown: CancellationToken,
}

impl Harness {
    /// 디스패처가 띄우는 모니터 태스크가 돌아가는 구성.
    pub async fn new() -> Self {
        Self::build(CancellationToken::new()).await
    }

    /// 디스패처가 띄운 모니터가 곧바로 멈추는 구성 (모니터를 테스트에서 직접 구동할 때).
    pub async fn with_manual_monitor() -> Self {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        Self::build(shutdown).await
    }

    async fn build(shutdown: CancellationToken) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let status = Arc::new(InMemoryStatusChannel::default());
        let exchange = MockExchangeProvider::new(ENTRY);
        let trader = ledger
            .insert_trader("alice", ApiCredentials::new("key", "secret", "pass"))
            .await;

        let ctx = ExecutionContext::new(
            ledger.clone(),
            status.clone(),
            Arc::new(exchange.clone()),
            ExecutionConfig::default(),
        )
        .with_clock(Arc::new(ImmediateClock));
        let monitors = Arc::new(MonitorRegistry::new(ctx.clone(), shutdown.clone()));
        let dispatcher = SignalDispatcher::new(ctx.clone(), monitors);

        Self {
            ledger,
            status,
            exchange,
            ctx,
            dispatcher,
            trader,
            shutdown,
        }
    }

    pub fn monitor(&self, position_id: i64) -> OrderMonitor {
        OrderMonitor::new(self.ctx.clone(), Arc::new(self.exchange.clone()), position_id)
    }

    pub async fn active_orders(&self, position_id: i64) -> (Vec<SltpOrder>, Vec<SltpOrder>) {
        self.ledger
            .active_sltp_orders(position_id)
            .await
            .unwrap()
            .into_iter()
            .partition(|o| o.plan_type == PlanType::StopLoss)
    }

    /// 포지션 수량이 체결 이력의 부호 있는 합과 같은지.
    pub async fn assert_history_matches(&self, position_id: i64) {
        let position = self.ledger.get_position(position_id).await.unwrap();
        let actions = self.ledger.position_actions(position_id).await.unwrap();
        assert_eq!(position.quantity, net_quantity(&actions));
    }
}
