//! 원장 저장소 및 상태 채널 구현.
//!
//! ```text
//! PositionLedger (trait, trader-core)
//! ├── PgLedger        // PostgreSQL
//! └── MemoryLedger    // 프로세스 내 메모리
//!
//! StatusChannel (trait, trader-core)
//! └── RedisStatusChannel
//! ```

mod ledger;
mod memory;
mod redis_status;

pub use self::ledger::PgLedger;
pub use self::memory::MemoryLedger;
pub use self::redis_status::{status_key, RedisStatusChannel};

use chrono::Utc;
use rust_decimal::Decimal;
use trader_core::domain::FillDetail;

/// 감사 로그 한 줄.
pub(crate) fn trace_line(comment: &str) -> String {
    format!("[{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), comment)
}

/// 체결 반영 감사 로그 문구.
pub(crate) fn fill_comment(
    remote_id: &str,
    fill: &FillDetail,
    before: Decimal,
    after: Decimal,
) -> String {
    format!(
        "fill {} {} @ {} (order {}, fee {}, profit {}): quantity {} -> {}",
        fill.side, fill.quantity, fill.price, remote_id, fill.fee, fill.profit, before, after
    )
}
