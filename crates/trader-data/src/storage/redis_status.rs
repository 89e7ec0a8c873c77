//! Redis 기반 포지션 변경 상태 채널.
//!
//! 키: `position:{id}:status`, 값: `changing` / `finished`.
//! `Changing`이 영원히 남지 않도록 모든 쓰기에 TTL 을 붙입니다.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};
use trader_core::domain::{PositionStatus, StatusChannel, StatusChannelError};

use crate::error::{DataError, Result};

/// 상태 키.
pub fn status_key(position_id: i64) -> String {
    format!("position:{}:status", position_id)
}

/// Redis 상태 채널.
#[derive(Clone)]
pub struct RedisStatusChannel {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisStatusChannel {
    /// Redis 연결 (자동 재연결).
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| DataError::Redis(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| DataError::Redis(e.to_string()))?;
        info!(ttl_secs = ttl.as_secs(), "Redis 상태 채널 연결 완료");
        Ok(Self { conn, ttl })
    }
}

impl std::fmt::Debug for RedisStatusChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStatusChannel")
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn backend(e: redis::RedisError) -> StatusChannelError {
    StatusChannelError::Backend(e.to_string())
}

#[async_trait]
impl StatusChannel for RedisStatusChannel {
    async fn read(&self, position_id: i64) -> std::result::Result<PositionStatus, StatusChannelError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(status_key(position_id)).await.map_err(backend)?;
        match value {
            None => Ok(PositionStatus::Idle),
            Some(raw) => raw.parse().map_err(StatusChannelError::Backend),
        }
    }

    async fn write(
        &self,
        position_id: i64,
        status: PositionStatus,
    ) -> std::result::Result<(), StatusChannelError> {
        let mut conn = self.conn.clone();
        let key = status_key(position_id);
        if status == PositionStatus::Idle {
            let _: () = conn.del(&key).await.map_err(backend)?;
        } else {
            let _: () = conn
                .set_ex(&key, status.as_str(), self.ttl.as_secs().max(1))
                .await
                .map_err(backend)?;
        }
        debug!(position_id, %status, "상태 기록");
        Ok(())
    }
}
