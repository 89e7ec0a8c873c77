//! PostgreSQL 연결 설정.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::error::{DataError, Result};

/// 데이터베이스 설정.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"***")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl DatabaseConfig {
    /// 환경변수에서 설정 로드.
    ///
    /// - `DATABASE_URL` (필수)
    /// - `DATABASE_MAX_CONNECTIONS` (기본 10)
    /// - `DATABASE_ACQUIRE_TIMEOUT_SECS` (기본 5)
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            DataError::Config("DATABASE_URL 환경변수가 설정되지 않았습니다".to_string())
        })?;

        Ok(Self {
            url,
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            acquire_timeout: Duration::from_secs(env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", 5)),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// 커넥션 풀 생성.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await
        .map_err(|e| DataError::Connection(e.to_string()))?;

    info!(max_connections = config.max_connections, "데이터베이스 연결 완료");
    Ok(pool)
}

/// 스키마 마이그레이션 적용.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| DataError::Migration(e.to_string()))?;
    info!("마이그레이션 적용 완료");
    Ok(())
}
