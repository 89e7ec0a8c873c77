//! 원장/거래소가 공유하는 닫힌 열거형 정의.
//!
//! 거래소와 DB에는 문자열/정수 코드로 저장되지만,
//! 코드 내부에서는 모든 분기를 `match`로 빠짐없이 처리할 수 있도록
//! 닫힌 열거형으로만 다룹니다.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// 거래 상품
// =============================================================================

/// 거래 상품 (거래소 심볼).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instrument {
    /// BTC 현물
    #[serde(rename = "BTCUSDT_SPBL")]
    BtcSpot,
    /// USDT 마진 BTC 무기한 선물
    #[serde(rename = "BTCUSDT_UMCBL")]
    BtcFutures,
}

impl Instrument {
    /// 거래소 심볼.
    pub fn symbol(&self) -> &'static str {
        match self {
            Instrument::BtcSpot => "BTCUSDT_SPBL",
            Instrument::BtcFutures => "BTCUSDT_UMCBL",
        }
    }

    /// 증거금 코인.
    pub fn margin_coin(&self) -> &'static str {
        "USDT"
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Instrument {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BTCUSDT_SPBL" => Ok(Instrument::BtcSpot),
            "BTCUSDT_UMCBL" => Ok(Instrument::BtcFutures),
            _ => Err(format!("Invalid instrument: {}", s)),
        }
    }
}

// =============================================================================
// 포지션 방향
// =============================================================================

/// 포지션 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// 반대 방향.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// 이 방향으로 진입(추가 진입 포함)하는 주문 방향.
    pub fn open_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::OpenLong,
            Direction::Short => OrderSide::OpenShort,
        }
    }

    /// 이 방향 포지션을 청산하는 주문 방향.
    pub fn close_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::CloseLong,
            Direction::Short => OrderSide::CloseShort,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" => Ok(Direction::Long),
            "short" => Ok(Direction::Short),
            _ => Err(format!("Invalid direction: {}", s)),
        }
    }
}

// =============================================================================
// 주문/체결 방향
// =============================================================================

/// 거래소에 제출하는 주문 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::OpenLong => "open_long",
            OrderSide::CloseLong => "close_long",
            OrderSide::OpenShort => "open_short",
            OrderSide::CloseShort => "close_short",
        }
    }

    /// 주문이 속한 포지션 방향.
    pub fn direction(&self) -> Direction {
        match self {
            OrderSide::OpenLong | OrderSide::CloseLong => Direction::Long,
            OrderSide::OpenShort | OrderSide::CloseShort => Direction::Short,
        }
    }

    pub fn is_opening(&self) -> bool {
        matches!(self, OrderSide::OpenLong | OrderSide::OpenShort)
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 체결 내역에 기록되는 방향.
///
/// 거래소가 알 수 없는 side 문자열을 돌려주면 `Unknown`으로 기록하고,
/// 수량 계산에서는 제외합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillSide {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
    Unknown,
}

impl FillSide {
    /// 거래소 문자열 해석. 인식하지 못하면 `Unknown`.
    pub fn from_exchange(raw: &str) -> Self {
        match raw {
            "open_long" => FillSide::OpenLong,
            "close_long" => FillSide::CloseLong,
            "open_short" => FillSide::OpenShort,
            "close_short" => FillSide::CloseShort,
            _ => FillSide::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FillSide::OpenLong => "open_long",
            FillSide::CloseLong => "close_long",
            FillSide::OpenShort => "open_short",
            FillSide::CloseShort => "close_short",
            FillSide::Unknown => "unknown",
        }
    }

    pub fn is_opening(&self) -> bool {
        matches!(self, FillSide::OpenLong | FillSide::OpenShort)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, FillSide::CloseLong | FillSide::CloseShort)
    }

    /// 포지션 수량에 반영되는 부호 있는 수량.
    ///
    /// 진입은 +, 청산은 -, `Unknown`은 0.
    pub fn signed_quantity(&self, quantity: Decimal) -> Decimal {
        match self {
            FillSide::OpenLong | FillSide::OpenShort => quantity,
            FillSide::CloseLong | FillSide::CloseShort => -quantity,
            FillSide::Unknown => Decimal::ZERO,
        }
    }
}

impl From<OrderSide> for FillSide {
    fn from(side: OrderSide) -> Self {
        match side {
            OrderSide::OpenLong => FillSide::OpenLong,
            OrderSide::CloseLong => FillSide::CloseLong,
            OrderSide::OpenShort => FillSide::OpenShort,
            OrderSide::CloseShort => FillSide::CloseShort,
        }
    }
}

impl fmt::Display for FillSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FillSide {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open_long" | "close_long" | "open_short" | "close_short" | "unknown" => {
                Ok(FillSide::from_exchange(s))
            }
            _ => Err(format!("Invalid fill side: {}", s)),
        }
    }
}

// =============================================================================
// 보호 주문 유형
// =============================================================================

/// 보호 주문(SLTP) 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanType {
    /// 익절
    #[serde(rename = "profit_plan")]
    TakeProfit,
    /// 손절
    #[serde(rename = "loss_plan")]
    StopLoss,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::TakeProfit => "profit_plan",
            PlanType::StopLoss => "loss_plan",
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profit_plan" => Ok(PlanType::TakeProfit),
            "loss_plan" => Ok(PlanType::StopLoss),
            _ => Err(format!("Invalid plan type: {}", s)),
        }
    }
}

// =============================================================================
// 레코드 상태
// =============================================================================

/// 포지션/보호 주문의 생명주기 상태.
///
/// DB에는 1(Active), 2(Inactive), 3(Pending) 코드로 저장됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordState {
    Active,
    Inactive,
    Pending,
}

impl RecordState {
    pub fn code(&self) -> i16 {
        match self {
            RecordState::Active => 1,
            RecordState::Inactive => 2,
            RecordState::Pending => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(RecordState::Active),
            2 => Some(RecordState::Inactive),
            3 => Some(RecordState::Pending),
            _ => None,
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordState::Active => write!(f, "Active"),
            RecordState::Inactive => write!(f, "Inactive"),
            RecordState::Pending => write!(f, "Pending"),
        }
    }
}
