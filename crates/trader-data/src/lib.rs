//! 영속성 계층.
//!
//! - `database`: PostgreSQL 연결과 마이그레이션
//! - `storage`: `PositionLedger` 구현체 (`PgLedger`, `MemoryLedger`)와
//!   `StatusChannel` 구현체 (`RedisStatusChannel`)

pub mod database;
pub mod error;
pub mod storage;

pub use database::DatabaseConfig;
pub use error::{DataError, Result};
pub use storage::{MemoryLedger, PgLedger, RedisStatusChannel};
