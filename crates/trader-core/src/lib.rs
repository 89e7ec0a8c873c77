//! 선물 포지션/보호 주문 생명주기의 핵심 도메인.
//!
//! 이 crate는 다음을 제공합니다:
//! - 닫힌 열거형 (상품, 방향, 체결 방향, 보호 주문 유형, 레코드 상태)
//! - 원장 레코드 (트레이더, 포지션, 체결 이력, 보호 주문)
//! - 원장 저장소 / 거래소 / 상태 채널 trait
//! - 전략 정책 상수

pub mod domain;
pub mod policy;

pub use domain::*;
