//! 도메인 모델 및 외부 협력자 추상화.

pub mod exchange_provider;
pub mod ledger;
pub mod records;
pub mod status;
pub mod types;

pub use exchange_provider::{
    ExchangeFactory, FillDetail, FuturesExchange, OrderState, OrderStatus,
    ProtectiveOrderStatus, ProviderError,
};
pub use ledger::{LedgerError, PositionLedger, PositionLockGuard};
pub use records::{
    average_entry_price, net_quantity, ApiCredentials, NewPosition, NewSltpOrder, Position,
    PositionAction, SltpOrder, Trader,
};
pub use status::{InMemoryStatusChannel, PositionStatus, StatusChannel, StatusChannelError};
pub use types::{Direction, FillSide, Instrument, OrderSide, PlanType, RecordState};
