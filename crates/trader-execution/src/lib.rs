//! 시그널 실행 및 포지션 관리.
//!
//! 이 crate는 다음을 제공합니다:
//! - 방향 시그널을 진입/추가 진입/청산으로 변환하는 디스패처
//! - 거래소 체결을 원장에 반영하는 체결 반영 루틴
//! - 손절/익절 래더 계산과 배치
//! - 포지션별 보호 주문 모니터
//!
//! # 예제
//!
//! ```rust,ignore
//! use trader_execution::{ExecutionConfig, ExecutionContext, MonitorRegistry, SignalDispatcher};
//!
//! let ctx = ExecutionContext::new(ledger, status, exchanges, ExecutionConfig::from_env());
//! let monitors = Arc::new(MonitorRegistry::new(ctx.clone(), shutdown.clone()));
//! let dispatcher = SignalDispatcher::new(ctx, monitors);
//!
//! dispatcher.dispatch(trader_id, Direction::Long, false).await?;
//! ```

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod ladder;
pub mod monitor;
pub mod orders;
pub mod reconciliation;

// 주요 타입 재내보내기
pub use config::{ExecutionConfig, OrderStyle};
pub use context::ExecutionContext;
pub use dispatcher::{DispatchOutcome, SignalDispatcher};
pub use error::{ExecutionError, ExecutionResult};
pub use ladder::{compute_ladder, tier_quantities, LadderKind, LadderLevel, LadderPlan};
pub use monitor::{
    FinishReason, MonitorClock, MonitorRegistry, OrderMonitor, PollOutcome, ProbeResult,
    TokioClock,
};
pub use reconciliation::{reconcile_fill, reconcile_fills};
