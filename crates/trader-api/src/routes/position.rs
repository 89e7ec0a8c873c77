//! 포지션 상태 조회 라우트

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use trader_core::domain::Direction;

use crate::{error::ApiResult, AppState};

/// 포지션 상태 응답.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PositionStateResponse {
    /// Active 포지션을 가진 트레이더가 있는지
    pub active_position: bool,
    /// 처음 발견한 Active 포지션의 방향
    pub position_type: Option<Direction>,
}

/// 어느 트레이더든 Active 포지션이 있으면 그 방향을 반환.
///
/// 트레이더 순서대로 보고, 트레이더별로는 가장 최근 포지션을 봅니다.
pub async fn position_state(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<PositionStateResponse>> {
    let ledger = state.ledger();
    for trader in ledger.list_traders().await? {
        let positions = ledger.active_positions(trader.id).await?;
        if let Some(position) = positions.iter().max_by_key(|p| p.id) {
            return Ok(Json(PositionStateResponse {
                active_position: true,
                position_type: Some(position.direction),
            }));
        }
    }

    Ok(Json(PositionStateResponse {
        active_position: false,
        position_type: None,
    }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::state::test_support::create_test_state;

    async fn fetch(state: Arc<AppState>) -> serde_json::Value {
        let app = Router::new()
            .route("/position-state", get(position_state))
            .with_state(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/position-state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_no_active_position() {
        let test = create_test_state(&["alice"]).await;
        let body = fetch(test.state.clone()).await;
        assert_eq!(
            body,
            serde_json::json!({"active_position": false, "position_type": null})
        );
    }

    #[tokio::test]
    async fn test_reports_short_position() {
        let test = create_test_state(&["alice", "bob"]).await;
        test.state
            .dispatcher
            .dispatch(test.traders[1].id, Direction::Short, false)
            .await
            .unwrap();

        let body = fetch(test.state.clone()).await;
        assert_eq!(
            body,
            serde_json::json!({"active_position": true, "position_type": "short"})
        );
    }
}
