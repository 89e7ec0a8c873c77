//! CoinCatch USDT 마진 선물(mix) REST 커넥터.

mod client;

pub use client::{
    pre_hash, sign, CoincatchClient, CoincatchConfig, FillRow, OrderDetail, SignPayload,
    CODE_PLAN_ORDER_NOT_FOUND, CODE_SUCCESS, DEFAULT_BASE_URL,
};
