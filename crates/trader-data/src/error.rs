//! 데이터 계층 에러 타입.

use thiserror::Error;
use trader_core::domain::LedgerError;

/// 연결/설정 단계의 에러.
///
/// 원장 연산 자체의 에러는 `LedgerError`로 보고합니다.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("설정 에러: {0}")]
    Config(String),

    #[error("데이터베이스 연결 에러: {0}")]
    Connection(String),

    #[error("마이그레이션 에러: {0}")]
    Migration(String),

    #[error("Redis 에러: {0}")]
    Redis(String),
}

pub type Result<T> = std::result::Result<T, DataError>;

/// sqlx 에러를 원장 에러로 변환.
///
/// 부분 유니크 인덱스 위반(트레이더당 Active 포지션 1개, 포지션당 Active 손절 1개)은
/// `Conflict`로 구분합니다.
pub(crate) fn ledger_err(e: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(ref db) = e {
        if db.is_unique_violation() {
            return LedgerError::Conflict(db.message().to_string());
        }
    }
    LedgerError::Backend(e.to_string())
}
