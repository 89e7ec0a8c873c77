//! 시그널 분배 서비스.
//!
//! 외부에서 들어온 방향 시그널을 모든 트레이더에게 나눠 백그라운드로 실행합니다.
//!
//! # 아키텍처
//!
//! ```text
//! POST /long            fan_out_signal()               SignalDispatcher
//!     │                       │                               │
//!     │ ── traders ─────────> │ ── spawn(trader 1) ─────────> │ dispatch()
//!     │ <── "Okay" ────────── │ ── spawn(trader 2) ─────────> │ dispatch()
//!     │                       │        ...   (트레이더별 시간 제한)
//! ```
//!
//! 트레이더 한 명의 실패나 시간 초과는 다른 트레이더에게 영향을 주지 않으며
//! 로그로만 남습니다. 시간 초과는 결과 대기만 멈추고 디스패치 자체는 취소하지 않습니다.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use trader_core::domain::{Direction, Trader};
use trader_core::policy;
use trader_execution::{DispatchOutcome, ExecutionResult, SignalDispatcher};

/// 트레이더 1명 처리 결과.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraderSignalResult {
    Completed(DispatchOutcome),
    Failed(String),
    TimedOut,
}

/// 방향별 트레이더당 처리 시간 한도.
pub fn signal_budget(direction: Direction) -> Duration {
    match direction {
        Direction::Long => policy::LONG_SIGNAL_BUDGET,
        Direction::Short => policy::SHORT_SIGNAL_BUDGET,
    }
}

/// 시그널을 트레이더별 백그라운드 태스크로 분배.
///
/// 태스크는 즉시 반환되며, 핸들은 테스트나 종료 처리에서만 기다립니다.
pub fn fan_out_signal(
    dispatcher: &SignalDispatcher,
    traders: Vec<Trader>,
    direction: Direction,
    just_close: bool,
) -> Vec<JoinHandle<TraderSignalResult>> {
    let budget = signal_budget(direction);
    info!(
        %direction,
        just_close,
        traders = traders.len(),
        ?budget,
        "시그널 분배"
    );

    traders
        .into_iter()
        .map(|trader| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(run_for_trader(dispatcher, trader, direction, just_close, budget))
        })
        .collect()
}

/// 트레이더 1명 처리.
///
/// 디스패치는 별도 태스크에서 돌고 시간 한도는 기다림에만 적용됩니다.
/// 한도를 넘겨도 진행 중인 작업(래더 교체 등)은 중간에 끊기지 않고 끝까지 실행됩니다.
async fn run_for_trader(
    dispatcher: SignalDispatcher,
    trader: Trader,
    direction: Direction,
    just_close: bool,
    budget: Duration,
) -> TraderSignalResult {
    let trader_id = trader.id;
    let mut work =
        tokio::spawn(async move { dispatcher.dispatch(trader_id, direction, just_close).await });

    match tokio::time::timeout(budget, &mut work).await {
        Ok(Ok(Ok(outcome))) => {
            info!(trader = %trader.name, %direction, ?outcome, "시그널 처리 완료");
            TraderSignalResult::Completed(outcome)
        }
        Ok(Ok(Err(e))) => {
            error!(
                trader = %trader.name,
                trader_id,
                %direction,
                error = %e,
                fatal = e.is_fatal(),
                "시그널 처리 실패"
            );
            TraderSignalResult::Failed(e.to_string())
        }
        Ok(Err(e)) => {
            error!(trader = %trader.name, trader_id, error = %e, "시그널 처리 태스크 비정상 종료");
            TraderSignalResult::Failed(e.to_string())
        }
        Err(_) => {
            warn!(
                trader = %trader.name,
                trader_id,
                %direction,
                ?budget,
                "시그널 처리 시간 초과, 작업은 백그라운드에서 계속"
            );
            tokio::spawn(log_late_result(work, trader.name, direction));
            TraderSignalResult::TimedOut
        }
    }
}

/// 시간 한도를 넘긴 디스패치의 최종 결과 기록.
async fn log_late_result(
    work: JoinHandle<ExecutionResult<DispatchOutcome>>,
    trader: String,
    direction: Direction,
) {
    match work.await {
        Ok(Ok(outcome)) => info!(%trader, %direction, ?outcome, "시간 초과 후 시그널 처리 완료"),
        Ok(Err(e)) => error!(%trader, %direction, error = %e, "시간 초과 후 시그널 처리 실패"),
        Err(e) => error!(%trader, error = %e, "시그널 처리 태스크 비정상 종료"),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use trader_core::domain::{PositionLedger, RecordState};

    use super::*;
    use crate::state::test_support::create_test_state;

    #[test]
    fn test_signal_budget() {
        assert_eq!(signal_budget(Direction::Long), Duration::from_secs(30));
        assert_eq!(signal_budget(Direction::Short), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_fan_out_runs_every_trader() {
        let app = create_test_state(&["alice", "bob"]).await;

        let handles = fan_out_signal(
            &app.state.dispatcher,
            app.traders.clone(),
            Direction::Long,
            false,
        );
        assert_eq!(handles.len(), 2);
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(
                result,
                TraderSignalResult::Completed(DispatchOutcome::Opened { .. })
            ));
        }

        for trader in &app.traders {
            let positions = app.ledger.active_positions(trader.id).await.unwrap();
            assert_eq!(positions.len(), 1);
            assert_eq!(positions[0].quantity, dec!(0.003));
            assert_eq!(positions[0].state, RecordState::Active);
        }
    }

    #[tokio::test]
    async fn test_one_trader_failure_is_isolated() {
        let app = create_test_state(&["alice", "bob"]).await;
        let mut ghost = app.traders[0].clone();
        ghost.id = 9_999;
        ghost.name = "ghost".to_string();

        let mut traders = vec![ghost];
        traders.push(app.traders[1].clone());
        let handles = fan_out_signal(&app.state.dispatcher, traders, Direction::Short, false);

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert!(matches!(results[0], TraderSignalResult::Failed(_)));
        assert!(matches!(
            results[1],
            TraderSignalResult::Completed(DispatchOutcome::Opened { .. })
        ));
    }

    #[tokio::test]
    async fn test_timed_out_dispatch_still_completes() {
        let app = create_test_state(&["alice"]).await;
        let trader = app.traders[0].clone();

        let result = run_for_trader(
            app.state.dispatcher.clone(),
            trader.clone(),
            Direction::Long,
            false,
            Duration::ZERO,
        )
        .await;
        assert_eq!(result, TraderSignalResult::TimedOut);

        // 기다림이 끝난 뒤에도 진입과 래더 배치가 끝까지 진행됨
        let ladder = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let positions = app.ledger.active_positions(trader.id).await.unwrap();
                if let Some(position) = positions.first() {
                    let orders = app.ledger.active_sltp_orders(position.id).await.unwrap();
                    if orders.len() == 4 {
                        return orders;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dispatch should finish after the budget elapsed");

        assert_eq!(ladder.iter().filter(|o| o.is_stop_loss()).count(), 1);
        assert_eq!(app.exchange.live_plan_orders().await.len(), 4);
    }
}
