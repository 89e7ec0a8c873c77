//! 실행 컨텍스트.
//!
//! 디스패처와 주문 모니터가 공유하는 협력자 묶음입니다.

use std::fmt;
use std::sync::Arc;

use trader_core::domain::{
    ExchangeFactory, FuturesExchange, PositionLedger, StatusChannel, Trader,
};

use crate::config::ExecutionConfig;
use crate::error::ExecutionResult;
use crate::monitor::{MonitorClock, TokioClock};

/// 원장, 상태 채널, 거래소 생성기, 설정, 시계.
#[derive(Clone)]
pub struct ExecutionContext {
    pub ledger: Arc<dyn PositionLedger>,
    pub status: Arc<dyn StatusChannel>,
    pub exchanges: Arc<dyn ExchangeFactory>,
    pub config: ExecutionConfig,
    pub clock: Arc<dyn MonitorClock>,
}

impl ExecutionContext {
    pub fn new(
        ledger: Arc<dyn PositionLedger>,
        status: Arc<dyn StatusChannel>,
        exchanges: Arc<dyn ExchangeFactory>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            ledger,
            status,
            exchanges,
            config,
            clock: Arc::new(TokioClock),
        }
    }

    /// 시계 교체 (테스트에서 실제 대기 없이 루프를 돌릴 때).
    pub fn with_clock(mut self, clock: Arc<dyn MonitorClock>) -> Self {
        self.clock = clock;
        self
    }

    /// 트레이더와 해당 트레이더의 거래소 클라이언트.
    pub async fn trader_exchange(
        &self,
        trader_id: i64,
    ) -> ExecutionResult<(Trader, Arc<dyn FuturesExchange>)> {
        let trader = self.ledger.get_trader(trader_id).await?;
        let exchange = self.exchanges.for_trader(&trader);
        Ok((trader, exchange))
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
