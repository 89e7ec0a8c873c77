//! API 에러 응답.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trader_core::domain::LedgerError;

/// 에러 응답 본문.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub code: String,
    pub message: String,
}

/// 핸들러 에러.
///
/// 시그널 처리 실패는 백그라운드에서만 관찰되므로, 여기에는 요청 자체를
/// 처리하지 못한 경우만 들어옵니다.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("원장 조회 실패: {0}")]
    Ledger(#[from] LedgerError),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Ledger(_) => "LEDGER_UNAVAILABLE",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "요청 처리 실패");
        let body = ApiErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
