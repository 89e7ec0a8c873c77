//! 지정가 우선 주문 (시장가 폴백).
//!
//! 지정가 주문을 제한된 횟수만큼 시도하고, 끝내 체결되지 않은 수량은
//! 시장가로 채웁니다. 가격은 양보하되 체결은 보장합니다.

use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use trader_core::domain::{FuturesExchange, Instrument, OrderSide, OrderState, ProviderError};
use trader_core::policy;

/// 지정가 재시도 설정.
#[derive(Debug, Clone)]
pub struct LimitFallbackConfig {
    /// 지정가 시도 횟수
    pub max_attempts: u32,
    /// 주문 후 상태 조회까지 대기 시간
    pub settle_interval: Duration,
}

impl Default for LimitFallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: policy::LIMIT_MAX_ATTEMPTS,
            settle_interval: policy::LIMIT_SETTLE_INTERVAL,
        }
    }
}

/// 지정가로 시도 후 남은 수량은 시장가로 주문.
///
/// 첫 시도는 `price`(없으면 마크 가격), 이후 시도는 매번 마크 가격을 새로 조회합니다.
/// 취소 자체가 실패하면 재시도를 중단하고 바로 시장가로 넘어갑니다.
///
/// 체결 수량이 있는 주문 ID들을 순서대로 반환합니다 (시장가 주문 포함).
pub async fn place_limit_with_fallback(
    exchange: &dyn FuturesExchange,
    instrument: Instrument,
    quantity: Decimal,
    side: OrderSide,
    price: Option<Decimal>,
    config: &LimitFallbackConfig,
) -> Result<Vec<String>, ProviderError> {
    let mut remaining = quantity;
    let mut order_ids = Vec::new();

    for attempt in 1..=config.max_attempts {
        let limit_price = match (attempt, price) {
            (1, Some(p)) => p,
            _ => match exchange.get_mark_price(instrument).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(attempt, error = %e, "마크 가격 조회 실패");
                    continue;
                }
            },
        };

        let order_id = match exchange
            .place_limit_order(instrument, remaining, side, limit_price)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(attempt, %side, error = %e, "지정가 주문 실패");
                continue;
            }
        };
        debug!(attempt, %order_id, %limit_price, %remaining, "지정가 주문 제출");

        tokio::time::sleep(config.settle_interval).await;

        let status = exchange
            .query_order_state(instrument, &order_id)
            .await
            .unwrap_or_else(|e| {
                warn!(%order_id, error = %e, "주문 상태 조회 실패");
                None
            });

        let filled = match status {
            Some(s) if s.state == OrderState::Filled => {
                order_ids.push(order_id);
                info!(attempt, %side, "지정가 주문 체결");
                return Ok(order_ids);
            }
            Some(s) if s.state == OrderState::Canceled => s.filled_quantity,
            _ => {
                if let Err(e) = exchange.cancel_order(instrument, &order_id).await {
                    warn!(%order_id, error = %e, "지정가 주문 취소 실패, 재시도 중단");
                    // 취소 실패는 대개 방금 체결된 경우
                    if let Ok(Some(s)) = exchange.query_order_state(instrument, &order_id).await {
                        if s.state == OrderState::Filled {
                            order_ids.push(order_id);
                            return Ok(order_ids);
                        }
                        if s.filled_quantity > Decimal::ZERO {
                            remaining -= s.filled_quantity;
                            order_ids.push(order_id);
                        }
                    }
                    break;
                }
                exchange
                    .query_order_state(instrument, &order_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|s| s.filled_quantity)
                    .unwrap_or(Decimal::ZERO)
            }
        };

        if filled > Decimal::ZERO {
            remaining -= filled;
            order_ids.push(order_id);
        }
        if remaining <= Decimal::ZERO {
            return Ok(order_ids);
        }
    }

    if remaining > Decimal::ZERO {
        info!(%side, %remaining, "지정가 미체결, 시장가 주문으로 전환");
        order_ids.push(exchange.place_market_order(instrument, remaining, side).await?);
    }
    Ok(order_ids)
}
