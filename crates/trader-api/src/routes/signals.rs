//! 방향 시그널 API 라우트
//!
//! `POST /long`, `POST /short`는 시그널을 모든 트레이더에게 분배하고
//! 처리 결과를 기다리지 않고 바로 응답합니다. 실제 매매 결과는 원장과
//! 감사 로그로만 확인할 수 있습니다.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use trader_core::domain::Direction;

use crate::{error::ApiResult, services::fan_out_signal, AppState};

// ==================== Request/Response 타입 ====================

/// 시그널 쿼리 파라미터.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalQuery {
    /// 반대 포지션 청산만 하고 새로 진입하지 않음
    #[serde(default)]
    pub just_close: bool,
}

/// 시그널 접수 응답.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalAccepted {
    pub msg: String,
}

impl SignalAccepted {
    fn okay() -> Self {
        Self {
            msg: "Okay".to_string(),
        }
    }
}

// ==================== 핸들러 ====================

/// 롱 시그널.
pub async fn long_signal(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SignalQuery>,
) -> ApiResult<Json<SignalAccepted>> {
    accept_signal(&state, Direction::Long, query.just_close).await
}

/// 숏 시그널.
pub async fn short_signal(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SignalQuery>,
) -> ApiResult<Json<SignalAccepted>> {
    accept_signal(&state, Direction::Short, query.just_close).await
}

async fn accept_signal(
    state: &AppState,
    direction: Direction,
    just_close: bool,
) -> ApiResult<Json<SignalAccepted>> {
    let traders = state.ledger().list_traders().await?;
    info!(%direction, just_close, traders = traders.len(), "시그널 접수");

    // 핸들은 버림: 결과는 태스크 안에서 로그로 남음
    drop(fan_out_signal(&state.dispatcher, traders, direction, just_close));
    Ok(Json(SignalAccepted::okay()))
}
