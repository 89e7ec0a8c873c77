//! API 라우트.
//!
//! | 메서드 | 경로 | 설명 |
//! |---|---|---|
//! | POST | `/long` | 롱 시그널 (`?just_close=true`면 청산만) |
//! | POST | `/short` | 숏 시그널 |
//! | GET | `/position-state` | Active 포지션 유무와 방향 |
//! | GET | `/health` | 헬스 체크 |

pub mod position;
pub mod signals;

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::AppState;

pub use position::{position_state, PositionStateResponse};
pub use signals::{long_signal, short_signal, SignalAccepted, SignalQuery};

/// 헬스 체크 응답.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// 실행 중인 주문 모니터 수
    pub monitors: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version,
        monitors: state.monitors().running_count(),
    })
}

/// 전체 API 라우터.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/long", post(long_signal))
        .route("/short", post(short_signal))
        .route("/position-state", get(position_state))
}
