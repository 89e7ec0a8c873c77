//! PgLedger 통합 테스트.
//!
//! 실제 PostgreSQL 이 필요합니다:
//!
//! ```text
//! DATABASE_URL=postgres://... cargo test -p trader-data -- --ignored
//! ```

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use trader_core::domain::{
    net_quantity, Direction, FillDetail, FillSide, Instrument, LedgerError, NewPosition,
    NewSltpOrder, PlanType, PositionLedger, RecordState,
};
use trader_data::database::{self, DatabaseConfig};
use trader_data::PgLedger;

async fn setup() -> (PgLedger, i64) {
    let config = DatabaseConfig::from_env().expect("DATABASE_URL");
    let pool = database::connect(&config).await.expect("connect");
    database::migrate(&pool).await.expect("migrate");

    let name = format!("it-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let (trader_id,): (i64,) = sqlx::query_as(
        "INSERT INTO traders (name, api_key, secret_key, api_passphrase) VALUES ($1, 'k', 's', 'p') RETURNING id",
    )
    .bind(&name)
    .fetch_one(&pool)
    .await
    .expect("insert trader");

    (PgLedger::new(pool), trader_id)
}

fn open_fill(quantity: Decimal) -> FillDetail {
    FillDetail {
        price: dec!(60000),
        quantity,
        fee: dec!(-0.108),
        profit: Decimal::ZERO,
        side: FillSide::OpenLong,
        filled_at: Utc::now(),
    }
}

#[tokio::test]
#[ignore]
async fn position_lifecycle_round_trip() {
    let (ledger, trader_id) = setup().await;

    let position = ledger
        .create_position(NewPosition {
            trader_id,
            instrument: Instrument::BtcFutures,
            direction: Direction::Long,
            quantity: dec!(0.003),
        })
        .await
        .unwrap();

    let err = ledger
        .create_position(NewPosition {
            trader_id,
            instrument: Instrument::BtcFutures,
            direction: Direction::Short,
            quantity: dec!(0.003),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));

    let (updated, _) = ledger
        .apply_fill(position.id, "it-1", &open_fill(dec!(0.003)))
        .await
        .unwrap();
    assert_eq!(updated.quantity, dec!(0.003));
    assert!(updated.is_ever_updated);

    let sl = ledger
        .create_sltp_order(NewSltpOrder {
            position_id: position.id,
            trader_id,
            instrument: Instrument::BtcFutures,
            plan_type: PlanType::StopLoss,
            trigger_price: dec!(59700.0),
            quantity: dec!(0.003),
            remote_id: "it-sl".to_string(),
        })
        .await
        .unwrap();

    let closed = ledger
        .apply_protective_fill(position.id, sl.id, true, "stop-loss filled")
        .await
        .unwrap();
    assert_eq!(closed.state, RecordState::Inactive);

    let actions = ledger.position_actions(position.id).await.unwrap();
    assert_eq!(net_quantity(&actions), closed.quantity);
}

#[tokio::test]
#[ignore]
async fn advisory_lock_is_released_on_commit() {
    let (ledger, _) = setup().await;
    let guard = ledger.lock_position(987_654).await.unwrap();
    guard.release().await.unwrap();

    let again = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        ledger.lock_position(987_654),
    )
    .await
    .expect("lock should be free");
    again.unwrap().release().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn lock_holders_do_not_exhaust_small_pool() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
    let config = DatabaseConfig {
        url,
        max_connections: 2,
        acquire_timeout: std::time::Duration::from_secs(2),
    };
    let pool = database::connect(&config).await.expect("connect");
    database::migrate(&pool).await.expect("migrate");
    let ledger = PgLedger::new(pool);

    // 잠금을 쥔 채 다른 커넥션으로 쓰는 작업 4개를 동시에 실행
    let ids = [987_700_i64, 987_701, 987_702, 987_703];
    let work = ids.iter().map(|&id| {
        let ledger = ledger.clone();
        async move {
            let guard = ledger.lock_position(id).await?;
            ledger.list_traders().await?;
            guard.release().await
        }
    });
    let results = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        spawn_all(work),
    )
    .await
    .expect("lock holders should not starve the pool");
    for result in results {
        result.unwrap();
    }
}

async fn spawn_all<F, T>(futures: impl IntoIterator<Item = F>) -> Vec<T>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.expect("task panicked"));
    }
    out
}
