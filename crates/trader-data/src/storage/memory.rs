//! 프로세스 내 메모리 포지션 원장.
//!
//! `PgLedger`와 같은 불변식과 원자성을 하나의 뮤텍스로 보장합니다.
//! 테스트와 페이퍼 트레이딩에서 사용합니다.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;
use trader_core::domain::{
    ApiCredentials, FillDetail, FillSide, LedgerError, NewPosition, NewSltpOrder, PlanType,
    Position, PositionAction, PositionLedger, PositionLockGuard, RecordState, SltpOrder, Trader,
};

use super::{fill_comment, trace_line};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    traders: BTreeMap<i64, Trader>,
    positions: BTreeMap<i64, Position>,
    actions: Vec<PositionAction>,
    sltp_orders: BTreeMap<i64, SltpOrder>,
    /// 남은 성공 횟수 뒤 보호 주문 기록 1회 실패
    sltp_record_failure: Option<u32>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn position_mut(&mut self, position_id: i64) -> Result<&mut Position, LedgerError> {
        self.positions
            .get_mut(&position_id)
            .ok_or(LedgerError::NotFound {
                entity: "position",
                id: position_id,
            })
    }

    fn sltp_mut(&mut self, order_id: i64) -> Result<&mut SltpOrder, LedgerError> {
        self.sltp_orders
            .get_mut(&order_id)
            .ok_or(LedgerError::NotFound {
                entity: "sltp_order",
                id: order_id,
            })
    }

    fn insert_position(&mut self, new: NewPosition) -> Position {
        let now = Utc::now();
        let position = Position {
            id: self.next_id(),
            trader_id: new.trader_id,
            instrument: new.instrument,
            direction: new.direction,
            quantity: new.quantity,
            state: RecordState::Active,
            is_ever_updated: false,
            number_of_openings: 0,
            pnl: Decimal::ZERO,
            trace: trace_line(&format!(
                "opened {} {} (requested {})",
                new.direction, new.instrument, new.quantity
            )),
            created: now,
            updated: now,
        };
        self.positions.insert(position.id, position.clone());
        position
    }

    fn inactivate_active_orders(&mut self, position_id: i64, comment: &str) -> u64 {
        let mut changed = 0;
        for order in self
            .sltp_orders
            .values_mut()
            .filter(|o| o.position_id == position_id && o.is_active())
        {
            order.state = RecordState::Inactive;
            order.trace.push_str(&trace_line(comment));
            order.updated = Utc::now();
            changed += 1;
        }
        changed
    }
}

/// 잠금 해제는 guard drop 으로 충분합니다.
struct MemoryLockGuard {
    position_id: i64,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl PositionLockGuard for MemoryLockGuard {
    fn position_id(&self) -> i64 {
        self.position_id
    }

    async fn release(self: Box<Self>) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// 메모리 포지션 원장.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 트레이더 등록.
    pub async fn insert_trader(&self, name: &str, credentials: ApiCredentials) -> Trader {
        let mut state = self.state.lock().await;
        let trader = Trader {
            id: state.next_id(),
            name: name.to_string(),
            credentials,
            pnl: Decimal::ZERO,
        };
        state.traders.insert(trader.id, trader.clone());
        trader
    }

    /// 유일성 검사 없이 Active 포지션 삽입.
    ///
    /// 손상된 저장소(트레이더당 Active 포지션 2개 이상)를 재현하는 용도입니다.
    pub async fn insert_position_unchecked(&self, new: NewPosition) -> Position {
        self.state.lock().await.insert_position(new)
    }

    /// 보호 주문 기록을 `successes`번 성공시킨 뒤 1회 백엔드 에러로 실패시킴.
    pub async fn fail_sltp_record_after(&self, successes: u32) {
        self.state.lock().await.sltp_record_failure = Some(successes);
    }

    /// 트레이더의 모든 포지션 (상태 무관, id 순).
    pub async fn positions_of(&self, trader_id: i64) -> Vec<Position> {
        self.state
            .lock()
            .await
            .positions
            .values()
            .filter(|p| p.trader_id == trader_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PositionLedger for MemoryLedger {
    async fn list_traders(&self) -> Result<Vec<Trader>, LedgerError> {
        Ok(self.state.lock().await.traders.values().cloned().collect())
    }

    async fn get_trader(&self, trader_id: i64) -> Result<Trader, LedgerError> {
        self.state
            .lock()
            .await
            .traders
            .get(&trader_id)
            .cloned()
            .ok_or(LedgerError::NotFound {
                entity: "trader",
                id: trader_id,
            })
    }

    async fn active_positions(&self, trader_id: i64) -> Result<Vec<Position>, LedgerError> {
        Ok(self
            .state
            .lock()
            .await
            .positions
            .values()
            .filter(|p| p.trader_id == trader_id && p.is_active())
            .cloned()
            .collect())
    }

    async fn all_active_positions(&self) -> Result<Vec<Position>, LedgerError> {
        Ok(self
            .state
            .lock()
            .await
            .positions
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect())
    }

    async fn get_position(&self, position_id: i64) -> Result<Position, LedgerError> {
        self.state
            .lock()
            .await
            .positions
            .get(&position_id)
            .cloned()
            .ok_or(LedgerError::NotFound {
                entity: "position",
                id: position_id,
            })
    }

    async fn create_position(&self, new: NewPosition) -> Result<Position, LedgerError> {
        let mut state = self.state.lock().await;
        if !state.traders.contains_key(&new.trader_id) {
            return Err(LedgerError::NotFound {
                entity: "trader",
                id: new.trader_id,
            });
        }
        if state
            .positions
            .values()
            .any(|p| p.trader_id == new.trader_id && p.is_active())
        {
            return Err(LedgerError::Conflict(format!(
                "trader {} already has an active position",
                new.trader_id
            )));
        }
        let position = state.insert_position(new);
        info!(position_id = position.id, direction = %position.direction, "포지션 생성");
        Ok(position)
    }

    async fn record_opening(&self, position_id: i64) -> Result<Position, LedgerError> {
        let mut state = self.state.lock().await;
        let position = state.position_mut(position_id)?;
        position.number_of_openings += 1;
        position.updated = Utc::now();
        Ok(position.clone())
    }

    async fn set_position_state(
        &self,
        position_id: i64,
        new_state: RecordState,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let position = state.position_mut(position_id)?;
        position.state = new_state;
        position.updated = Utc::now();
        Ok(())
    }

    async fn append_position_comment(
        &self,
        position_id: i64,
        comment: &str,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let position = state.position_mut(position_id)?;
        position.trace.push_str(&trace_line(comment));
        Ok(())
    }

    async fn lock_position(
        &self,
        position_id: i64,
    ) -> Result<Box<dyn PositionLockGuard>, LedgerError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(position_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        Ok(Box::new(MemoryLockGuard {
            position_id,
            _guard: guard,
        }))
    }

    async fn apply_fill(
        &self,
        position_id: i64,
        remote_id: &str,
        fill: &FillDetail,
    ) -> Result<(Position, PositionAction), LedgerError> {
        let mut state = self.state.lock().await;
        let action_id = state.next_id();

        let position = state.position_mut(position_id)?;
        let before = position.quantity;
        // 첫 체결은 생성 시의 요청 수량을 대체 (방향 불명 체결은 수량 유지)
        let base = if position.is_ever_updated || fill.side == FillSide::Unknown {
            position.quantity
        } else {
            Decimal::ZERO
        };
        let quantity = base + fill.side.signed_quantity(fill.quantity);
        let realized = fill.profit + fill.fee;

        position.quantity = quantity;
        position.is_ever_updated = true;
        position.pnl += realized;
        if quantity <= Decimal::ZERO {
            position.state = RecordState::Inactive;
        }
        position
            .trace
            .push_str(&trace_line(&fill_comment(remote_id, fill, before, quantity)));
        position.updated = Utc::now();
        let position = position.clone();

        let action = PositionAction {
            id: action_id,
            position_id,
            trader_id: position.trader_id,
            side: fill.side,
            price: fill.price,
            quantity: fill.quantity,
            instrument: position.instrument,
            remote_id: remote_id.to_string(),
            profit: fill.profit,
            fee: fill.fee,
            created: fill.filled_at,
        };
        state.actions.push(action.clone());

        if let Some(trader) = state.traders.get_mut(&position.trader_id) {
            trader.pnl += realized;
        }

        Ok((position, action))
    }

    async fn apply_protective_fill(
        &self,
        position_id: i64,
        order_id: i64,
        close_position: bool,
        comment: &str,
    ) -> Result<Position, LedgerError> {
        let mut state = self.state.lock().await;
        let position = state.position_mut(position_id)?.clone();
        let order = state.sltp_mut(order_id)?.clone();
        if order.position_id != position_id {
            return Err(LedgerError::NotFound {
                entity: "sltp_order",
                id: order_id,
            });
        }
        if !order.is_active() {
            return Ok(position);
        }

        let filled = order.quantity.min(position.quantity.max(Decimal::ZERO));
        let action_id = state.next_id();
        state.actions.push(PositionAction {
            id: action_id,
            position_id,
            trader_id: position.trader_id,
            side: FillSide::from(position.direction.close_side()),
            price: order.trigger_price,
            quantity: filled,
            instrument: position.instrument,
            remote_id: order.remote_id.clone(),
            profit: Decimal::ZERO,
            fee: Decimal::ZERO,
            created: Utc::now(),
        });

        {
            let stored = state.sltp_mut(order_id)?;
            stored.state = RecordState::Inactive;
            stored.trace.push_str(&trace_line("triggered"));
            stored.updated = Utc::now();
        }

        let quantity = position.quantity - filled;
        let closing = close_position || quantity <= Decimal::ZERO;
        if closing {
            state.inactivate_active_orders(position_id, "inactivated with position");
        }

        let stored = state.position_mut(position_id)?;
        stored.quantity = quantity;
        if closing {
            stored.state = RecordState::Inactive;
        }
        stored.trace.push_str(&trace_line(&format!(
            "{} (order {} {} {} @ {}): quantity {} -> {}",
            comment,
            order.remote_id,
            order.plan_type,
            filled,
            order.trigger_price,
            position.quantity,
            quantity
        )));
        stored.updated = Utc::now();
        Ok(stored.clone())
    }

    async fn position_actions(
        &self,
        position_id: i64,
    ) -> Result<Vec<PositionAction>, LedgerError> {
        Ok(self
            .state
            .lock()
            .await
            .actions
            .iter()
            .filter(|a| a.position_id == position_id)
            .cloned()
            .collect())
    }

    async fn create_sltp_order(&self, new: NewSltpOrder) -> Result<SltpOrder, LedgerError> {
        let mut state = self.state.lock().await;
        state.position_mut(new.position_id)?;
        match state.sltp_record_failure {
            Some(0) => {
                state.sltp_record_failure = None;
                return Err(LedgerError::Backend("injected sltp write failure".to_string()));
            }
            Some(left) => state.sltp_record_failure = Some(left - 1),
            None => {}
        }
        if new.plan_type == PlanType::StopLoss
            && state
                .sltp_orders
                .values()
                .any(|o| o.position_id == new.position_id && o.is_active() && o.is_stop_loss())
        {
            return Err(LedgerError::Conflict(format!(
                "position {} already has an active stop-loss",
                new.position_id
            )));
        }

        let now = Utc::now();
        let order = SltpOrder {
            id: state.next_id(),
            position_id: new.position_id,
            trader_id: new.trader_id,
            instrument: new.instrument,
            plan_type: new.plan_type,
            trigger_price: new.trigger_price,
            quantity: new.quantity,
            state: RecordState::Active,
            remote_id: new.remote_id,
            trace: trace_line("placed"),
            created: now,
            updated: now,
        };
        state.sltp_orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get_sltp_order(&self, order_id: i64) -> Result<SltpOrder, LedgerError> {
        Ok(self.state.lock().await.sltp_mut(order_id)?.clone())
    }

    async fn active_sltp_orders(&self, position_id: i64) -> Result<Vec<SltpOrder>, LedgerError> {
        Ok(self
            .state
            .lock()
            .await
            .sltp_orders
            .values()
            .filter(|o| o.position_id == position_id && o.is_active())
            .cloned()
            .collect())
    }

    async fn inactivate_sltp_order(&self, order_id: i64) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let order = state.sltp_mut(order_id)?;
        order.state = RecordState::Inactive;
        order.trace.push_str(&trace_line("inactivated"));
        order.updated = Utc::now();
        Ok(())
    }

    async fn inactivate_all_sltp_orders(&self, position_id: i64) -> Result<u64, LedgerError> {
        Ok(self
            .state
            .lock()
            .await
            .inactivate_active_orders(position_id, "inactivated with ladder"))
    }

    async fn update_trigger_price(
        &self,
        order_id: i64,
        trigger_price: Decimal,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let order = state.sltp_mut(order_id)?;
        order.trigger_price = trigger_price;
        order
            .trace
            .push_str(&trace_line(&format!("trigger price -> {}", trigger_price)));
        order.updated = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use trader_core::domain::{net_quantity, Direction, Instrument};

    use super::*;

    async fn ledger_with_trader() -> (MemoryLedger, Trader) {
        let ledger = MemoryLedger::new();
        let trader = ledger
            .insert_trader("alpha", ApiCredentials::new("k", "s", "p"))
            .await;
        (ledger, trader)
    }

    fn new_position(trader_id: i64, direction: Direction) -> NewPosition {
        NewPosition {
            trader_id,
            instrument: Instrument::BtcFutures,
            direction,
            quantity: dec!(0.003),
        }
    }

    fn fill(side: FillSide, price: Decimal, quantity: Decimal) -> FillDetail {
        FillDetail {
            price,
            quantity,
            fee: dec!(-0.1),
            profit: Decimal::ZERO,
            side,
            filled_at: Utc::now(),
        }
    }

    fn stop_loss(position: &Position, remote_id: &str) -> NewSltpOrder {
        NewSltpOrder {
            position_id: position.id,
            trader_id: position.trader_id,
            instrument: position.instrument,
            plan_type: PlanType::StopLoss,
            trigger_price: dec!(59700),
            quantity: position.quantity,
            remote_id: remote_id.to_string(),
        }
    }

    #[tokio::test]
    async fn one_active_position_per_trader() {
        let (ledger, trader) = ledger_with_trader().await;
        ledger
            .create_position(new_position(trader.id, Direction::Long))
            .await
            .unwrap();

        let err = ledger
            .create_position(new_position(trader.id, Direction::Short))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn first_fill_replaces_provisional_quantity() {
        let (ledger, trader) = ledger_with_trader().await;
        let position = ledger
            .create_position(new_position(trader.id, Direction::Long))
            .await
            .unwrap();

        let (updated, _) = ledger
            .apply_fill(position.id, "o1", &fill(FillSide::OpenLong, dec!(60000), dec!(0.002)))
            .await
            .unwrap();
        assert_eq!(updated.quantity, dec!(0.002));
        assert!(updated.is_ever_updated);

        let (updated, _) = ledger
            .apply_fill(position.id, "o2", &fill(FillSide::OpenLong, dec!(60100), dec!(0.003)))
            .await
            .unwrap();
        assert_eq!(updated.quantity, dec!(0.005));
        assert_eq!(updated.pnl, dec!(-0.2));

        let actions = ledger.position_actions(position.id).await.unwrap();
        assert_eq!(net_quantity(&actions), updated.quantity);
        assert_eq!(ledger.get_trader(trader.id).await.unwrap().pnl, dec!(-0.2));
    }

    #[tokio::test]
    async fn unknown_side_leaves_quantity_unchanged() {
        let (ledger, trader) = ledger_with_trader().await;
        let position = ledger
            .create_position(new_position(trader.id, Direction::Short))
            .await
            .unwrap();
        ledger
            .apply_fill(position.id, "o1", &fill(FillSide::OpenShort, dec!(60000), dec!(0.003)))
            .await
            .unwrap();

        let (updated, action) = ledger
            .apply_fill(position.id, "o2", &fill(FillSide::Unknown, dec!(60000), dec!(0.003)))
            .await
            .unwrap();
        assert_eq!(updated.quantity, dec!(0.003));
        assert_eq!(action.side, FillSide::Unknown);
        assert!(updated.is_active());
    }

    #[tokio::test]
    async fn unknown_first_fill_marks_updated_and_keeps_quantity() {
        let (ledger, trader) = ledger_with_trader().await;
        let position = ledger
            .create_position(new_position(trader.id, Direction::Long))
            .await
            .unwrap();

        let (updated, _) = ledger
            .apply_fill(position.id, "o1", &fill(FillSide::Unknown, dec!(60000), dec!(0.003)))
            .await
            .unwrap();
        assert!(updated.is_ever_updated);
        assert_eq!(updated.quantity, dec!(0.003));
        assert!(updated.is_active());

        // 이력 합(0)과 달라지므로 체결 반영 단계에서 불변식 위반으로 잡힘
        let actions = ledger.position_actions(position.id).await.unwrap();
        assert_eq!(net_quantity(&actions), Decimal::ZERO);
    }

    #[tokio::test]
    async fn closing_fill_inactivates_position() {
        let (ledger, trader) = ledger_with_trader().await;
        let position = ledger
            .create_position(new_position(trader.id, Direction::Long))
            .await
            .unwrap();
        ledger
            .apply_fill(position.id, "o1", &fill(FillSide::OpenLong, dec!(60000), dec!(0.003)))
            .await
            .unwrap();

        let (updated, _) = ledger
            .apply_fill(position.id, "o2", &fill(FillSide::CloseLong, dec!(61000), dec!(0.003)))
            .await
            .unwrap();
        assert_eq!(updated.quantity, Decimal::ZERO);
        assert_eq!(updated.state, RecordState::Inactive);
        assert!(ledger.active_positions(trader.id).await.unwrap().is_empty());
        assert!(updated.trace.contains("close_long"));
    }

    #[tokio::test]
    async fn second_active_stop_loss_is_rejected() {
        let (ledger, trader) = ledger_with_trader().await;
        let position = ledger
            .create_position(new_position(trader.id, Direction::Long))
            .await
            .unwrap();
        let first = ledger
            .create_sltp_order(stop_loss(&position, "sl-1"))
            .await
            .unwrap();

        let err = ledger
            .create_sltp_order(stop_loss(&position, "sl-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        ledger.inactivate_sltp_order(first.id).await.unwrap();
        assert!(ledger.create_sltp_order(stop_loss(&position, "sl-3")).await.is_ok());
    }

    #[tokio::test]
    async fn protective_fill_records_close_action() {
        let (ledger, trader) = ledger_with_trader().await;
        let position = ledger
            .create_position(new_position(trader.id, Direction::Long))
            .await
            .unwrap();
        ledger
            .apply_fill(position.id, "o1", &fill(FillSide::OpenLong, dec!(60000), dec!(0.003)))
            .await
            .unwrap();
        let sl = ledger
            .create_sltp_order(stop_loss(&position, "sl-1"))
            .await
            .unwrap();
        let tp = ledger
            .create_sltp_order(NewSltpOrder {
                plan_type: PlanType::TakeProfit,
                trigger_price: dec!(60600),
                quantity: dec!(0.001),
                ..stop_loss(&position, "tp-1")
            })
            .await
            .unwrap();

        let updated = ledger
            .apply_protective_fill(position.id, tp.id, false, "take-profit filled")
            .await
            .unwrap();
        assert_eq!(updated.quantity, dec!(0.002));
        assert!(updated.is_active());
        assert!(!ledger.get_sltp_order(tp.id).await.unwrap().is_active());

        let actions = ledger.position_actions(position.id).await.unwrap();
        let last = actions.last().unwrap();
        assert_eq!(last.side, FillSide::CloseLong);
        assert_eq!(last.price, dec!(60600));
        assert_eq!(last.remote_id, "tp-1");
        assert_eq!(net_quantity(&actions), updated.quantity);

        // 같은 발동을 다시 반영해도 변화 없음
        let again = ledger
            .apply_protective_fill(position.id, tp.id, false, "take-profit filled")
            .await
            .unwrap();
        assert_eq!(again.quantity, dec!(0.002));

        let closed = ledger
            .apply_protective_fill(position.id, sl.id, true, "stop-loss filled")
            .await
            .unwrap();
        assert_eq!(closed.state, RecordState::Inactive);
        assert!(ledger.active_sltp_orders(position.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_position_serializes_holders() {
        let ledger = Arc::new(MemoryLedger::new());
        let guard = ledger.lock_position(1).await.unwrap();
        assert_eq!(guard.position_id(), 1);

        let contender = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let guard = ledger.lock_position(1).await.unwrap();
                guard.release().await.unwrap();
            })
        };

        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        guard.release().await.unwrap();
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn inactivate_all_reports_count() {
        let (ledger, trader) = ledger_with_trader().await;
        let position = ledger
            .create_position(new_position(trader.id, Direction::Short))
            .await
            .unwrap();
        ledger
            .create_sltp_order(stop_loss(&position, "sl-1"))
            .await
            .unwrap();
        ledger
            .create_sltp_order(NewSltpOrder {
                plan_type: PlanType::TakeProfit,
                ..stop_loss(&position, "tp-1")
            })
            .await
            .unwrap();

        assert_eq!(ledger.inactivate_all_sltp_orders(position.id).await.unwrap(), 2);
        assert_eq!(ledger.inactivate_all_sltp_orders(position.id).await.unwrap(), 0);
    }
}
