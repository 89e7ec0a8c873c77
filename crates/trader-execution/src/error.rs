//! 실행 계층 에러.

use thiserror::Error;
use trader_core::domain::{LedgerError, ProviderError};

/// 실행 에러.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// 거래소 에러
    #[error("거래소 에러: {0}")]
    Exchange(#[from] ProviderError),

    /// 원장 에러
    #[error("원장 에러: {0}")]
    Ledger(#[from] LedgerError),

    /// 정합성 위반 (Active 포지션/손절/익절 개수 등)
    #[error("정합성 위반: {0}")]
    Consistency(String),

    /// 도달하면 안 되는 상태
    #[error("포지션 #{position_id} 불변식 위반: {reason}")]
    Invariant { position_id: i64, reason: String },

    /// 보호 주문 래더 배치 실패 (포지션은 정리됨)
    #[error("포지션 #{position_id} 보호 주문 배치 실패: {source}")]
    LadderPlacement {
        position_id: i64,
        #[source]
        source: ProviderError,
    },
}

impl ExecutionError {
    /// 재시도하지 말고 운영자에게 알려야 하는 에러인지.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutionError::Consistency(_) | ExecutionError::Invariant { .. }
        )
    }
}

/// 실행 결과 타입.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ExecutionError::Consistency("2 active positions".into()).is_fatal());
        assert!(ExecutionError::Invariant {
            position_id: 1,
            reason: "no take-profit".into()
        }
        .is_fatal());
        assert!(!ExecutionError::Exchange(ProviderError::Network("reset".into())).is_fatal());
        assert!(!ExecutionError::Ledger(LedgerError::Backend("pool".into())).is_fatal());
    }
}
