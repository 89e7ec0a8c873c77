//! 트레이딩 봇 HTTP 서버 구성 요소.
//!
//! 바이너리(`main.rs`)가 쓰는 라우터, 상태, 설정, 시그널 분배 서비스를 제공합니다.
//!
//! # 설계 원칙
//!
//! - 시그널 엔드포인트는 백그라운드 태스크 예약까지만 하고 바로 응답
//! - 트레이더별 실패/시간 초과는 로그로만 남고 다른 트레이더에 영향 없음

pub mod config;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
pub mod telemetry;

pub use config::{LogFormat, ServerConfig};
pub use error::{ApiError, ApiErrorResponse, ApiResult};
pub use routes::create_api_router;
pub use state::AppState;
