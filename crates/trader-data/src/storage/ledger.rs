//! PostgreSQL 포지션 원장.
//!
//! 모든 다중 행 갱신(체결 반영, 보호 주문 발동 반영)은 하나의 트랜잭션으로 처리하고,
//! 대상 포지션 행은 `FOR UPDATE`로 잠근 뒤 읽습니다.
//!
//! 추가 진입/청산 동안의 잠금(`lock_position`)은 트랜잭션 범위 advisory lock 입니다.
//! 행 잠금(`FOR UPDATE`)을 쓰면 같은 작업 안에서 다른 커넥션으로 나가는
//! 체결 반영 쓰기가 자기 자신을 기다리게 됩니다.
//!
//! 잠금을 쥔 작업은 커넥션 1개를 점유한 채 쓰기용 커넥션을 하나 더 빌립니다.
//! 동시에 잠금을 쥘 수 있는 작업 수를 풀 크기의 절반으로 제한해
//! 잠금 보유자끼리 풀을 소진하지 않게 합니다.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, Transaction};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument};
use trader_core::domain::{
    ApiCredentials, Direction, FillDetail, FillSide, Instrument, LedgerError, NewPosition,
    NewSltpOrder, PlanType, Position, PositionAction, PositionLedger, PositionLockGuard,
    RecordState, SltpOrder, Trader,
};

use super::{fill_comment, trace_line};
use crate::error::ledger_err;

// ================================================================================================
// Rows
// ================================================================================================

#[derive(Debug, Clone, FromRow)]
struct TraderRow {
    id: i64,
    name: String,
    api_key: String,
    secret_key: String,
    api_passphrase: String,
    pnl: Decimal,
}

impl From<TraderRow> for Trader {
    fn from(row: TraderRow) -> Self {
        Trader {
            id: row.id,
            name: row.name,
            credentials: ApiCredentials::new(row.api_key, row.secret_key, row.api_passphrase),
            pnl: row.pnl,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct PositionRow {
    id: i64,
    trader_id: i64,
    instrument: String,
    direction: String,
    quantity: Decimal,
    state: i16,
    is_ever_updated: bool,
    number_of_openings: i32,
    pnl: Decimal,
    trace: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl TryFrom<PositionRow> for Position {
    type Error = LedgerError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        Ok(Position {
            id: row.id,
            trader_id: row.trader_id,
            instrument: Instrument::from_str(&row.instrument).map_err(LedgerError::Corrupt)?,
            direction: Direction::from_str(&row.direction).map_err(LedgerError::Corrupt)?,
            quantity: row.quantity,
            state: parse_state(row.state)?,
            is_ever_updated: row.is_ever_updated,
            number_of_openings: row.number_of_openings,
            pnl: row.pnl,
            trace: row.trace,
            created: row.created,
            updated: row.updated,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct ActionRow {
    id: i64,
    position_id: i64,
    trader_id: i64,
    action_side: String,
    price: Decimal,
    quantity: Decimal,
    instrument: String,
    remote_id: String,
    profit: Decimal,
    fee: Decimal,
    created: DateTime<Utc>,
}

impl TryFrom<ActionRow> for PositionAction {
    type Error = LedgerError;

    fn try_from(row: ActionRow) -> Result<Self, Self::Error> {
        Ok(PositionAction {
            id: row.id,
            position_id: row.position_id,
            trader_id: row.trader_id,
            side: FillSide::from_str(&row.action_side).map_err(LedgerError::Corrupt)?,
            price: row.price,
            quantity: row.quantity,
            instrument: Instrument::from_str(&row.instrument).map_err(LedgerError::Corrupt)?,
            remote_id: row.remote_id,
            profit: row.profit,
            fee: row.fee,
            created: row.created,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct SltpRow {
    id: i64,
    position_id: i64,
    trader_id: i64,
    instrument: String,
    plan_type: String,
    trigger_price: Decimal,
    quantity: Decimal,
    state: i16,
    remote_id: String,
    trace: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl TryFrom<SltpRow> for SltpOrder {
    type Error = LedgerError;

    fn try_from(row: SltpRow) -> Result<Self, Self::Error> {
        Ok(SltpOrder {
            id: row.id,
            position_id: row.position_id,
            trader_id: row.trader_id,
            instrument: Instrument::from_str(&row.instrument).map_err(LedgerError::Corrupt)?,
            plan_type: PlanType::from_str(&row.plan_type).map_err(LedgerError::Corrupt)?,
            trigger_price: row.trigger_price,
            quantity: row.quantity,
            state: parse_state(row.state)?,
            remote_id: row.remote_id,
            trace: row.trace,
            created: row.created,
            updated: row.updated,
        })
    }
}

fn parse_state(code: i16) -> Result<RecordState, LedgerError> {
    RecordState::from_code(code)
        .ok_or_else(|| LedgerError::Corrupt(format!("Invalid record state code: {}", code)))
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>, LedgerError>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ================================================================================================
// Lock guard
// ================================================================================================

/// advisory lock 을 쥐고 있는 트랜잭션. drop 되면 롤백되며 잠금도 풀립니다.
struct PgLockGuard {
    position_id: i64,
    tx: Transaction<'static, Postgres>,
    // 커밋 뒤에 반납되도록 tx 보다 뒤에 선언
    _holder: OwnedSemaphorePermit,
}

#[async_trait]
impl PositionLockGuard for PgLockGuard {
    fn position_id(&self) -> i64 {
        self.position_id
    }

    async fn release(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await.map_err(ledger_err)
    }
}

// ================================================================================================
// PgLedger
// ================================================================================================

/// 풀 크기에 대한 동시 잠금 보유자 상한.
///
/// 보유자마다 커넥션 2개가 필요하므로 절반까지만 허용합니다 (최소 1).
pub fn lock_holder_limit(max_connections: u32) -> usize {
    (max_connections / 2).max(1) as usize
}

/// PostgreSQL 포지션 원장.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    lock_holders: Arc<Semaphore>,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        let limit = lock_holder_limit(pool.options().get_max_connections());
        debug!(limit, "포지션 잠금 동시 보유 상한");
        Self {
            pool,
            lock_holders: Arc::new(Semaphore::new(limit)),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn position_for_update(
        tx: &mut Transaction<'static, Postgres>,
        position_id: i64,
    ) -> Result<Position, LedgerError> {
        let row: PositionRow = sqlx::query_as("SELECT * FROM positions WHERE id = $1 FOR UPDATE")
            .bind(position_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(ledger_err)?
            .ok_or(LedgerError::NotFound {
                entity: "position",
                id: position_id,
            })?;
        Position::try_from(row)
    }
}

#[async_trait]
impl PositionLedger for PgLedger {
    async fn list_traders(&self) -> Result<Vec<Trader>, LedgerError> {
        let rows: Vec<TraderRow> = sqlx::query_as("SELECT * FROM traders ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(ledger_err)?;
        Ok(rows.into_iter().map(Trader::from).collect())
    }

    async fn get_trader(&self, trader_id: i64) -> Result<Trader, LedgerError> {
        let row: TraderRow = sqlx::query_as("SELECT * FROM traders WHERE id = $1")
            .bind(trader_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ledger_err)?
            .ok_or(LedgerError::NotFound {
                entity: "trader",
                id: trader_id,
            })?;
        Ok(row.into())
    }

    async fn active_positions(&self, trader_id: i64) -> Result<Vec<Position>, LedgerError> {
        let rows: Vec<PositionRow> =
            sqlx::query_as("SELECT * FROM positions WHERE trader_id = $1 AND state = $2 ORDER BY id")
                .bind(trader_id)
                .bind(RecordState::Active.code())
                .fetch_all(&self.pool)
                .await
                .map_err(ledger_err)?;
        collect(rows)
    }

    async fn all_active_positions(&self) -> Result<Vec<Position>, LedgerError> {
        let rows: Vec<PositionRow> =
            sqlx::query_as("SELECT * FROM positions WHERE state = $1 ORDER BY id")
                .bind(RecordState::Active.code())
                .fetch_all(&self.pool)
                .await
                .map_err(ledger_err)?;
        collect(rows)
    }

    async fn get_position(&self, position_id: i64) -> Result<Position, LedgerError> {
        let row: PositionRow = sqlx::query_as("SELECT * FROM positions WHERE id = $1")
            .bind(position_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ledger_err)?
            .ok_or(LedgerError::NotFound {
                entity: "position",
                id: position_id,
            })?;
        Position::try_from(row)
    }

    #[instrument(skip(self), fields(trader_id = new.trader_id))]
    async fn create_position(&self, new: NewPosition) -> Result<Position, LedgerError> {
        let row: PositionRow = sqlx::query_as(
            r#"
            INSERT INTO positions (trader_id, instrument, direction, quantity, state, trace)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(new.trader_id)
        .bind(new.instrument.symbol())
        .bind(new.direction.as_str())
        .bind(new.quantity)
        .bind(RecordState::Active.code())
        .bind(trace_line(&format!(
            "opened {} {} (requested {})",
            new.direction, new.instrument, new.quantity
        )))
        .fetch_one(&self.pool)
        .await
        .map_err(ledger_err)?;

        let position = Position::try_from(row)?;
        info!(position_id = position.id, direction = %position.direction, "포지션 생성");
        Ok(position)
    }

    async fn record_opening(&self, position_id: i64) -> Result<Position, LedgerError> {
        let row: PositionRow = sqlx::query_as(
            r#"
            UPDATE positions
            SET number_of_openings = number_of_openings + 1, updated = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ledger_err)?
        .ok_or(LedgerError::NotFound {
            entity: "position",
            id: position_id,
        })?;
        Position::try_from(row)
    }

    async fn set_position_state(
        &self,
        position_id: i64,
        state: RecordState,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE positions SET state = $2, updated = NOW() WHERE id = $1")
            .bind(position_id)
            .bind(state.code())
            .execute(&self.pool)
            .await
            .map_err(ledger_err)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound {
                entity: "position",
                id: position_id,
            });
        }
        Ok(())
    }

    async fn append_position_comment(
        &self,
        position_id: i64,
        comment: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE positions SET trace = COALESCE(trace, '') || $2, updated = NOW() WHERE id = $1",
        )
        .bind(position_id)
        .bind(trace_line(comment))
        .execute(&self.pool)
        .await
        .map_err(ledger_err)?;
        Ok(())
    }

    async fn lock_position(
        &self,
        position_id: i64,
    ) -> Result<Box<dyn PositionLockGuard>, LedgerError> {
        // 커넥션을 빌리기 전에 보유자 슬롯부터 확보
        let holder = self
            .lock_holders
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;
        let mut tx = self.pool.begin().await.map_err(ledger_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(position_id)
            .execute(&mut *tx)
            .await
            .map_err(ledger_err)?;
        debug!(position_id, "포지션 잠금 획득");
        Ok(Box::new(PgLockGuard {
            position_id,
            tx,
            _holder: holder,
        }))
    }

    #[instrument(skip(self, fill), fields(side = %fill.side, quantity = %fill.quantity))]
    async fn apply_fill(
        &self,
        position_id: i64,
        remote_id: &str,
        fill: &FillDetail,
    ) -> Result<(Position, PositionAction), LedgerError> {
        let mut tx = self.pool.begin().await.map_err(ledger_err)?;
        let position = Self::position_for_update(&mut tx, position_id).await?;

        // 첫 체결은 생성 시의 요청 수량을 대체 (방향 불명 체결은 수량 유지)
        let base = if position.is_ever_updated || fill.side == FillSide::Unknown {
            position.quantity
        } else {
            Decimal::ZERO
        };
        let quantity = base + fill.side.signed_quantity(fill.quantity);
        let realized = fill.profit + fill.fee;
        let state = if quantity <= Decimal::ZERO {
            RecordState::Inactive
        } else {
            position.state
        };

        let action: ActionRow = sqlx::query_as(
            r#"
            INSERT INTO position_actions
                (position_id, trader_id, action_side, price, quantity, instrument, remote_id, profit, fee, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(position.id)
        .bind(position.trader_id)
        .bind(fill.side.as_str())
        .bind(fill.price)
        .bind(fill.quantity)
        .bind(position.instrument.symbol())
        .bind(remote_id)
        .bind(fill.profit)
        .bind(fill.fee)
        .bind(fill.filled_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(ledger_err)?;

        let row: PositionRow = sqlx::query_as(
            r#"
            UPDATE positions
            SET quantity = $2,
                is_ever_updated = TRUE,
                pnl = pnl + $3,
                state = $4,
                trace = COALESCE(trace, '') || $5,
                updated = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(position.id)
        .bind(quantity)
        .bind(realized)
        .bind(state.code())
        .bind(trace_line(&fill_comment(remote_id, fill, position.quantity, quantity)))
        .fetch_one(&mut *tx)
        .await
        .map_err(ledger_err)?;

        sqlx::query("UPDATE traders SET pnl = pnl + $2, updated = NOW() WHERE id = $1")
            .bind(position.trader_id)
            .bind(realized)
            .execute(&mut *tx)
            .await
            .map_err(ledger_err)?;

        tx.commit().await.map_err(ledger_err)?;

        Ok((Position::try_from(row)?, PositionAction::try_from(action)?))
    }

    #[instrument(skip(self, comment))]
    async fn apply_protective_fill(
        &self,
        position_id: i64,
        order_id: i64,
        close_position: bool,
        comment: &str,
    ) -> Result<Position, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(ledger_err)?;
        let position = Self::position_for_update(&mut tx, position_id).await?;

        let order_row: SltpRow = sqlx::query_as(
            "SELECT * FROM sltp_orders WHERE id = $1 AND position_id = $2 FOR UPDATE",
        )
        .bind(order_id)
        .bind(position_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(ledger_err)?
        .ok_or(LedgerError::NotFound {
            entity: "sltp_order",
            id: order_id,
        })?;
        let order = SltpOrder::try_from(order_row)?;

        // 이미 반영된 발동
        if !order.is_active() {
            tx.commit().await.map_err(ledger_err)?;
            return Ok(position);
        }

        // 남은 수량보다 많이 줄이지 않음 (익절 후 손절 발동 등)
        let filled = order.quantity.min(position.quantity.max(Decimal::ZERO));
        let side = FillSide::from(position.direction.close_side());
        sqlx::query(
            r#"
            INSERT INTO position_actions
                (position_id, trader_id, action_side, price, quantity, instrument, remote_id, profit, fee)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, 0)
            "#,
        )
        .bind(position.id)
        .bind(position.trader_id)
        .bind(side.as_str())
        .bind(order.trigger_price)
        .bind(filled)
        .bind(position.instrument.symbol())
        .bind(&order.remote_id)
        .execute(&mut *tx)
        .await
        .map_err(ledger_err)?;

        sqlx::query(
            r#"
            UPDATE sltp_orders
            SET state = $2, trace = COALESCE(trace, '') || $3, updated = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(RecordState::Inactive.code())
        .bind(trace_line("triggered"))
        .execute(&mut *tx)
        .await
        .map_err(ledger_err)?;

        let quantity = position.quantity - filled;
        let state = if close_position || quantity <= Decimal::ZERO {
            sqlx::query(
                "UPDATE sltp_orders SET state = $2, updated = NOW() WHERE position_id = $1 AND state = $3",
            )
            .bind(position.id)
            .bind(RecordState::Inactive.code())
            .bind(RecordState::Active.code())
            .execute(&mut *tx)
            .await
            .map_err(ledger_err)?;
            RecordState::Inactive
        } else {
            position.state
        };

        let row: PositionRow = sqlx::query_as(
            r#"
            UPDATE positions
            SET quantity = $2, state = $3, trace = COALESCE(trace, '') || $4, updated = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(position.id)
        .bind(quantity)
        .bind(state.code())
        .bind(trace_line(&format!(
            "{} (order {} {} {} @ {}): quantity {} -> {}",
            comment,
            order.remote_id,
            order.plan_type,
            filled,
            order.trigger_price,
            position.quantity,
            quantity
        )))
        .fetch_one(&mut *tx)
        .await
        .map_err(ledger_err)?;

        tx.commit().await.map_err(ledger_err)?;
        Position::try_from(row)
    }

    async fn position_actions(
        &self,
        position_id: i64,
    ) -> Result<Vec<PositionAction>, LedgerError> {
        let rows: Vec<ActionRow> =
            sqlx::query_as("SELECT * FROM position_actions WHERE position_id = $1 ORDER BY id")
                .bind(position_id)
                .fetch_all(&self.pool)
                .await
                .map_err(ledger_err)?;
        collect(rows)
    }

    #[instrument(skip(self), fields(position_id = new.position_id, plan_type = %new.plan_type))]
    async fn create_sltp_order(&self, new: NewSltpOrder) -> Result<SltpOrder, LedgerError> {
        let row: SltpRow = sqlx::query_as(
            r#"
            INSERT INTO sltp_orders
                (position_id, trader_id, instrument, quantity, plan_type, trigger_price, state, remote_id, trace)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(new.position_id)
        .bind(new.trader_id)
        .bind(new.instrument.symbol())
        .bind(new.quantity)
        .bind(new.plan_type.as_str())
        .bind(new.trigger_price)
        .bind(RecordState::Active.code())
        .bind(&new.remote_id)
        .bind(trace_line("placed"))
        .fetch_one(&self.pool)
        .await
        .map_err(ledger_err)?;
        SltpOrder::try_from(row)
    }

    async fn get_sltp_order(&self, order_id: i64) -> Result<SltpOrder, LedgerError> {
        let row: SltpRow = sqlx::query_as("SELECT * FROM sltp_orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ledger_err)?
            .ok_or(LedgerError::NotFound {
                entity: "sltp_order",
                id: order_id,
            })?;
        SltpOrder::try_from(row)
    }

    async fn active_sltp_orders(&self, position_id: i64) -> Result<Vec<SltpOrder>, LedgerError> {
        let rows: Vec<SltpRow> = sqlx::query_as(
            "SELECT * FROM sltp_orders WHERE position_id = $1 AND state = $2 ORDER BY id",
        )
        .bind(position_id)
        .bind(RecordState::Active.code())
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_err)?;
        collect(rows)
    }

    async fn inactivate_sltp_order(&self, order_id: i64) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE sltp_orders
            SET state = $2, trace = COALESCE(trace, '') || $3, updated = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(RecordState::Inactive.code())
        .bind(trace_line("inactivated"))
        .execute(&self.pool)
        .await
        .map_err(ledger_err)?;
        Ok(())
    }

    async fn inactivate_all_sltp_orders(&self, position_id: i64) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE sltp_orders
            SET state = $2, trace = COALESCE(trace, '') || $4, updated = NOW()
            WHERE position_id = $1 AND state = $3
            "#,
        )
        .bind(position_id)
        .bind(RecordState::Inactive.code())
        .bind(RecordState::Active.code())
        .bind(trace_line("inactivated with ladder"))
        .execute(&self.pool)
        .await
        .map_err(ledger_err)?;
        Ok(result.rows_affected())
    }

    async fn update_trigger_price(
        &self,
        order_id: i64,
        trigger_price: Decimal,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE sltp_orders
            SET trigger_price = $2, trace = COALESCE(trace, '') || $3, updated = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(trigger_price)
        .bind(trace_line(&format!("trigger price -> {}", trigger_price)))
        .execute(&self.pool)
        .await
        .map_err(ledger_err)?;
        Ok(())
    }
}
