//! Mock 선물 거래소 (테스트/페이퍼 트레이딩).
//!
//! 실제 거래소와 같은 `FuturesExchange` 인터페이스를 제공하는 메모리 내 시뮬레이터입니다.
//!
//! - 시장가 주문은 현재 마크 가격으로 즉시 체결됩니다.
//! - 수수료는 체결 금액 × 수수료율 (음수), 청산 손익은 평균 진입가 대비로 계산합니다.
//! - 보호 주문은 `trigger_plan_order()`로 발동시킬 때까지 살아있습니다.
//! - 테스트에서 실패를 주입할 수 있습니다 (취소 실패, 조회 실패, 체결 반영 지연).
//!
//! 트레이더별 클라이언트가 모두 같은 시뮬레이터 상태를 공유하므로
//! `ExchangeFactory`로도 그대로 쓸 수 있습니다.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::debug;
use trader_core::domain::{
    Direction, ExchangeFactory, FillDetail, FillSide, FuturesExchange, Instrument, OrderSide,
    OrderState, OrderStatus, PlanType, ProtectiveOrderStatus, ProviderError, SltpOrder, Trader,
};

use crate::connector::coincatch::CODE_PLAN_ORDER_NOT_FOUND;

/// 지정가 주문 처리 방식.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitBehavior {
    /// 즉시 전량 체결
    FillImmediately,
    /// 체결되지 않고 대기
    Rest,
    /// 일부만 체결되고 대기
    FillPartially(Decimal),
}

/// 시뮬레이터에 배치된 보호 주문.
#[derive(Debug, Clone, PartialEq)]
pub struct MockPlanOrder {
    pub order_id: String,
    pub plan_type: PlanType,
    pub trigger_price: Decimal,
    pub hold_side: Direction,
    pub quantity: Decimal,
    /// 거래소에 살아있는지 (발동/취소되면 false)
    pub live: bool,
}

/// 시뮬레이터에 제출된 일반 주문.
#[derive(Debug, Clone, PartialEq)]
pub struct MockOrder {
    pub order_id: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub state: OrderState,
    pub filled_quantity: Decimal,
}

#[derive(Debug, Default, Clone, Copy)]
struct Exposure {
    quantity: Decimal,
    average_price: Decimal,
}

#[derive(Debug)]
struct MockState {
    next_id: u64,
    mark_price: Decimal,
    fee_rate: Decimal,
    orders: Vec<MockOrder>,
    fills: HashMap<String, FillDetail>,
    plans: Vec<MockPlanOrder>,
    exposure: HashMap<Direction, Exposure>,
    limit_behavior: LimitBehavior,
    fail_cancels: bool,
    fail_protective_placements: u32,
    modify_failures: u32,
    modify_calls: u32,
    fill_lag: u32,
}

impl MockState {
    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("mock-{}", self.next_id)
    }

    /// 체결을 포지션 노출에 반영하고 체결 상세 생성.
    fn execute(&mut self, side: OrderSide, quantity: Decimal, price: Decimal) -> FillDetail {
        let direction = side.direction();
        let exposure = self.exposure.entry(direction).or_default();

        let profit = if side.is_opening() {
            let total = exposure.quantity + quantity;
            if !total.is_zero() {
                exposure.average_price =
                    (exposure.average_price * exposure.quantity + price * quantity) / total;
            }
            exposure.quantity = total;
            Decimal::ZERO
        } else {
            let closed = quantity.min(exposure.quantity);
            exposure.quantity -= closed;
            let diff = match direction {
                Direction::Long => price - exposure.average_price,
                Direction::Short => exposure.average_price - price,
            };
            (diff * closed).round_dp(8)
        };

        FillDetail {
            price,
            quantity,
            fee: -(price * quantity * self.fee_rate).round_dp(8),
            profit,
            side: FillSide::from(side),
            filled_at: Utc::now(),
        }
    }

    fn order_mut(&mut self, order_id: &str) -> Option<&mut MockOrder> {
        self.orders.iter_mut().find(|o| o.order_id == order_id)
    }

    fn plan_mut(&mut self, order_id: &str) -> Option<&mut MockPlanOrder> {
        self.plans.iter_mut().find(|p| p.order_id == order_id)
    }
}

/// Mock 선물 거래소.
#[derive(Debug, Clone)]
pub struct MockExchangeProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockExchangeProvider {
    /// 주어진 마크 가격으로 시작하는 시뮬레이터 생성.
    pub fn new(mark_price: Decimal) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_id: 0,
                mark_price,
                fee_rate: dec!(0.0006),
                orders: Vec::new(),
                fills: HashMap::new(),
                plans: Vec::new(),
                exposure: HashMap::new(),
                limit_behavior: LimitBehavior::FillImmediately,
                fail_cancels: false,
                fail_protective_placements: 0,
                modify_failures: 0,
                modify_calls: 0,
                fill_lag: 0,
            })),
        }
    }

    // ==================== 시뮬레이션 제어 ====================

    pub async fn set_mark_price(&self, price: Decimal) {
        self.state.lock().await.mark_price = price;
    }

    pub async fn set_fee_rate(&self, rate: Decimal) {
        self.state.lock().await.fee_rate = rate;
    }

    pub async fn set_limit_behavior(&self, behavior: LimitBehavior) {
        self.state.lock().await.limit_behavior = behavior;
    }

    /// 일반/보호 주문 취소를 모두 실패시킴.
    pub async fn fail_cancels(&self, fail: bool) {
        self.state.lock().await.fail_cancels = fail;
    }

    /// 다음 `count`번의 보호 주문 배치를 실패시킴.
    pub async fn fail_next_protective_placements(&self, count: u32) {
        self.state.lock().await.fail_protective_placements = count;
    }

    /// 다음 `count`번의 보호 주문 정정을 네트워크 에러로 실패시킴.
    pub async fn fail_next_modifications(&self, count: u32) {
        self.state.lock().await.modify_failures = count;
    }

    /// 체결 조회가 `count`번 `NotFound`를 돌려준 뒤 성공하도록 지연.
    pub async fn delay_fills(&self, count: u32) {
        self.state.lock().await.fill_lag = count;
    }

    /// 보호 주문 발동: 거래소에서 주문을 없애고 트리거 가격으로 청산 체결.
    pub async fn trigger_plan_order(&self, order_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(plan) = state.plan_mut(order_id) else {
            return false;
        };
        if !plan.live {
            return false;
        }
        plan.live = false;
        let (side, quantity, price) = (
            plan.hold_side.close_side(),
            plan.quantity,
            plan.trigger_price,
        );
        state.execute(side, quantity, price);
        debug!(order_id, %price, "Mock 보호 주문 발동");
        true
    }

    // ==================== 검증용 조회 ====================

    pub async fn orders(&self) -> Vec<MockOrder> {
        self.state.lock().await.orders.clone()
    }

    pub async fn market_orders(&self) -> Vec<MockOrder> {
        self.state
            .lock()
            .await
            .orders
            .iter()
            .filter(|o| o.price.is_none())
            .cloned()
            .collect()
    }

    pub async fn plan_orders(&self) -> Vec<MockPlanOrder> {
        self.state.lock().await.plans.clone()
    }

    pub async fn live_plan_orders(&self) -> Vec<MockPlanOrder> {
        self.state
            .lock()
            .await
            .plans
            .iter()
            .filter(|p| p.live)
            .cloned()
            .collect()
    }

    pub async fn plan_order(&self, order_id: &str) -> Option<MockPlanOrder> {
        self.state
            .lock()
            .await
            .plans
            .iter()
            .find(|p| p.order_id == order_id)
            .cloned()
    }

    pub async fn modify_calls(&self) -> u32 {
        self.state.lock().await.modify_calls
    }

    /// 방향별 거래소 측 보유 수량.
    pub async fn exposure(&self, direction: Direction) -> Decimal {
        self.state
            .lock()
            .await
            .exposure
            .get(&direction)
            .map(|e| e.quantity)
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl FuturesExchange for MockExchangeProvider {
    async fn place_market_order(
        &self,
        _instrument: Instrument,
        quantity: Decimal,
        side: OrderSide,
    ) -> Result<String, ProviderError> {
        let mut state = self.state.lock().await;
        let order_id = state.next_order_id();
        let price = state.mark_price;
        let fill = state.execute(side, quantity, price);
        state.fills.insert(order_id.clone(), fill);
        state.orders.push(MockOrder {
            order_id: order_id.clone(),
            side,
            quantity,
            price: None,
            state: OrderState::Filled,
            filled_quantity: quantity,
        });
        debug!(%order_id, %side, %quantity, %price, "Mock 시장가 체결");
        Ok(order_id)
    }

    async fn place_limit_order(
        &self,
        _instrument: Instrument,
        quantity: Decimal,
        side: OrderSide,
        price: Decimal,
    ) -> Result<String, ProviderError> {
        let mut state = self.state.lock().await;
        let order_id = state.next_order_id();
        let filled = match state.limit_behavior {
            LimitBehavior::FillImmediately => quantity,
            LimitBehavior::Rest => Decimal::ZERO,
            LimitBehavior::FillPartially(qty) => qty.min(quantity),
        };
        if filled > Decimal::ZERO {
            let fill = state.execute(side, filled, price);
            state.fills.insert(order_id.clone(), fill);
        }
        let order_state = if filled == quantity {
            OrderState::Filled
        } else if filled.is_zero() {
            OrderState::New
        } else {
            OrderState::PartiallyFilled
        };
        state.orders.push(MockOrder {
            order_id: order_id.clone(),
            side,
            quantity,
            price: Some(price),
            state: order_state,
            filled_quantity: filled,
        });
        Ok(order_id)
    }

    async fn cancel_order(
        &self,
        _instrument: Instrument,
        order_id: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.fail_cancels {
            return Err(ProviderError::Network("mock cancel failure".to_string()));
        }
        let order = state
            .order_mut(order_id)
            .ok_or_else(|| ProviderError::NotFound(format!("order {}", order_id)))?;
        match order.state {
            OrderState::New | OrderState::PartiallyFilled => {
                order.state = OrderState::Canceled;
                Ok(())
            }
            _ => Err(ProviderError::Api {
                code: "40768".to_string(),
                message: "order already finished".to_string(),
            }),
        }
    }

    async fn place_protective_order(
        &self,
        _instrument: Instrument,
        plan_type: PlanType,
        trigger_price: Decimal,
        hold_side: Direction,
        quantity: Decimal,
    ) -> Result<String, ProviderError> {
        let mut state = self.state.lock().await;
        if state.fail_protective_placements > 0 {
            state.fail_protective_placements -= 1;
            return Err(ProviderError::Api {
                code: "40000".to_string(),
                message: "mock placement failure".to_string(),
            });
        }
        let order_id = state.next_order_id();
        state.plans.push(MockPlanOrder {
            order_id: order_id.clone(),
            plan_type,
            trigger_price,
            hold_side,
            quantity,
            live: true,
        });
        Ok(order_id)
    }

    async fn modify_protective_order(
        &self,
        order: &SltpOrder,
        trigger_price: Decimal,
    ) -> Result<ProtectiveOrderStatus, ProviderError> {
        let mut state = self.state.lock().await;
        state.modify_calls += 1;
        if state.modify_failures > 0 {
            state.modify_failures -= 1;
            return Err(ProviderError::Network("mock modify failure".to_string()));
        }
        match state.plan_mut(&order.remote_id) {
            Some(plan) if plan.live => {
                plan.trigger_price = trigger_price;
                Ok(ProtectiveOrderStatus::Confirmed)
            }
            _ => Ok(ProtectiveOrderStatus::Triggered),
        }
    }

    async fn cancel_protective_order(&self, order: &SltpOrder) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.fail_cancels {
            return Err(ProviderError::Network("mock cancel failure".to_string()));
        }
        match state.plan_mut(&order.remote_id) {
            Some(plan) if plan.live => {
                plan.live = false;
                Ok(())
            }
            _ => Err(ProviderError::Api {
                code: CODE_PLAN_ORDER_NOT_FOUND.to_string(),
                message: "plan order does not exist".to_string(),
            }),
        }
    }

    async fn query_fill(
        &self,
        _instrument: Instrument,
        order_id: &str,
    ) -> Result<FillDetail, ProviderError> {
        let mut state = self.state.lock().await;
        if state.fill_lag > 0 {
            state.fill_lag -= 1;
            return Err(ProviderError::NotFound(format!("order {} fills", order_id)));
        }
        state
            .fills
            .get(order_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("order {} fills", order_id)))
    }

    async fn query_order_state(
        &self,
        _instrument: Instrument,
        order_id: &str,
    ) -> Result<Option<OrderStatus>, ProviderError> {
        let mut state = self.state.lock().await;
        Ok(state.order_mut(order_id).map(|o| OrderStatus {
            state: o.state,
            filled_quantity: o.filled_quantity,
        }))
    }

    async fn get_mark_price(&self, _instrument: Instrument) -> Result<Decimal, ProviderError> {
        Ok(self.state.lock().await.mark_price)
    }

    fn exchange_name(&self) -> &str {
        "mock"
    }
}

impl ExchangeFactory for MockExchangeProvider {
    fn for_trader(&self, _trader: &Trader) -> Arc<dyn FuturesExchange> {
        Arc::new(self.clone())
    }
}
