//! 포지션 변경 상태 채널 (pseudo-lock).
//!
//! 시그널 디스패처가 추가 진입/청산을 시작하기 전에 `Changing`을 쓰고,
//! 끝나면 `Finished`를 씁니다. 주문 모니터는 `Changing`을 보면
//! 해당 폴링 사이클을 건너뜁니다.
//!
//! 이 채널은 **권고(advisory)** 용도입니다. 다른 쓰기를 막지 않으며
//! 정합성은 원장의 행 잠금(`PositionLedger::lock_position`)이 보장합니다.
//!
//! # 구현체
//!
//! ```text
//! StatusChannel (trait)
//! ├── InMemoryStatusChannel   // 단일 프로세스, TTL 만료 지원
//! └── RedisStatusChannel      // trader-data, 다중 프로세스 공유
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

/// 포지션 변경 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionStatus {
    /// 기록 없음
    Idle,
    /// 추가 진입/청산 진행 중
    Changing,
    /// 마지막 변경 완료
    Finished,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Idle => "idle",
            PositionStatus::Changing => "changing",
            PositionStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(PositionStatus::Idle),
            "changing" => Ok(PositionStatus::Changing),
            "finished" => Ok(PositionStatus::Finished),
            _ => Err(format!("Invalid position status: {}", s)),
        }
    }
}

/// 상태 채널 에러.
#[derive(Debug, Error)]
pub enum StatusChannelError {
    #[error("상태 채널 백엔드 에러: {0}")]
    Backend(String),
}

/// 포지션 변경 상태 채널.
#[async_trait]
pub trait StatusChannel: Send + Sync {
    async fn read(&self, position_id: i64) -> Result<PositionStatus, StatusChannelError>;

    async fn write(
        &self,
        position_id: i64,
        status: PositionStatus,
    ) -> Result<(), StatusChannelError>;

    /// 변경 진행 중인지 확인.
    ///
    /// 읽기 실패는 로그만 남기고 `false`로 취급합니다 (권고용 채널).
    async fn is_changing(&self, position_id: i64) -> bool {
        match self.read(position_id).await {
            Ok(status) => status == PositionStatus::Changing,
            Err(e) => {
                warn!(position_id, error = %e, "상태 채널 읽기 실패, 변경 없음으로 간주");
                false
            }
        }
    }

    /// 상태 기록. 실패는 로그만 남깁니다.
    async fn publish(&self, position_id: i64, status: PositionStatus) {
        if let Err(e) = self.write(position_id, status).await {
            warn!(position_id, %status, error = %e, "상태 채널 쓰기 실패");
        }
    }
}

// ==================== InMemoryStatusChannel ====================

/// 저장 항목.
struct StatusEntry {
    status: PositionStatus,
    written_at: Instant,
}

/// 프로세스 내 상태 채널.
///
/// `Changing`은 TTL이 지나면 `Idle`로 읽힙니다. 변경 도중 태스크가 중단되어
/// `Finished`를 쓰지 못해도 모니터가 영원히 멈추지 않게 하기 위함입니다.
pub struct InMemoryStatusChannel {
    entries: RwLock<HashMap<i64, StatusEntry>>,
    ttl: Duration,
}

impl InMemoryStatusChannel {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }
}

impl Default for InMemoryStatusChannel {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl fmt::Debug for InMemoryStatusChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStatusChannel")
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[async_trait]
impl StatusChannel for InMemoryStatusChannel {
    async fn read(&self, position_id: i64) -> Result<PositionStatus, StatusChannelError> {
        let guard = self.entries.read().await;
        Ok(guard
            .get(&position_id)
            .filter(|entry| entry.written_at.elapsed() < self.ttl)
            .map(|entry| entry.status)
            .unwrap_or(PositionStatus::Idle))
    }

    async fn write(
        &self,
        position_id: i64,
        status: PositionStatus,
    ) -> Result<(), StatusChannelError> {
        let mut guard = self.entries.write().await;
        if status == PositionStatus::Idle {
            guard.remove(&position_id);
        } else {
            guard.insert(
                position_id,
                StatusEntry {
                    status,
                    written_at: Instant::now(),
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_position_reads_idle() {
        let channel = InMemoryStatusChannel::default();
        assert_eq!(channel.read(7).await.unwrap(), PositionStatus::Idle);
        assert!(!channel.is_changing(7).await);
    }

    #[tokio::test]
    async fn changing_then_finished() {
        let channel = InMemoryStatusChannel::default();
        channel.publish(1, PositionStatus::Changing).await;
        assert!(channel.is_changing(1).await);
        assert!(!channel.is_changing(2).await);

        channel.publish(1, PositionStatus::Finished).await;
        assert_eq!(channel.read(1).await.unwrap(), PositionStatus::Finished);
        assert!(!channel.is_changing(1).await);
    }

    #[tokio::test]
    async fn changing_expires_after_ttl() {
        let channel = InMemoryStatusChannel::new(Duration::from_millis(30));
        channel.publish(3, PositionStatus::Changing).await;
        assert!(channel.is_changing(3).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!channel.is_changing(3).await);
    }

    #[test]
    fn wire_names() {
        assert_eq!("changing".parse::<PositionStatus>().unwrap(), PositionStatus::Changing);
        assert_eq!(PositionStatus::Finished.to_string(), "finished");
        assert!("pending".parse::<PositionStatus>().is_err());
    }
}
