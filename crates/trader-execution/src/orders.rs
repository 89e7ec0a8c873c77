//! 주문 제출.

use rust_decimal::Decimal;
use tracing::debug;
use trader_core::domain::{FuturesExchange, Instrument, OrderSide, ProviderError};
use trader_exchange::place_limit_with_fallback;

use crate::config::{ExecutionConfig, OrderStyle};

/// 설정된 방식으로 주문을 제출하고 체결 대상 주문 ID 목록을 반환.
///
/// 시장가는 항상 주문 1건, 지정가 폴백은 부분 체결마다 1건씩 늘어날 수 있습니다.
pub async fn submit_order(
    exchange: &dyn FuturesExchange,
    config: &ExecutionConfig,
    instrument: Instrument,
    quantity: Decimal,
    side: OrderSide,
) -> Result<Vec<String>, ProviderError> {
    debug!(%side, %quantity, style = %config.entry_order, "주문 제출");
    match config.entry_order {
        OrderStyle::Market => Ok(vec![
            exchange.place_market_order(instrument, quantity, side).await?,
        ]),
        OrderStyle::LimitWithFallback => {
            place_limit_with_fallback(exchange, instrument, quantity, side, None, &config.limit)
                .await
        }
    }
}
