//! CoinCatch FuturesExchange 구현.
//!
//! CoincatchClient를 래핑하여 거래소 중립적인 인터페이스를 제공합니다.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::debug;
use trader_core::domain::{
    Direction, ExchangeFactory, FillDetail, FuturesExchange, Instrument, OrderSide, OrderStatus,
    PlanType, ProtectiveOrderStatus, ProviderError, SltpOrder, Trader,
};

use crate::connector::coincatch::{CoincatchClient, CoincatchConfig, DEFAULT_BASE_URL};

/// CoinCatch FuturesExchange 구현.
pub struct CoincatchExchangeProvider {
    client: CoincatchClient,
}

impl CoincatchExchangeProvider {
    pub fn new(client: CoincatchClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FuturesExchange for CoincatchExchangeProvider {
    async fn place_market_order(
        &self,
        instrument: Instrument,
        quantity: Decimal,
        side: OrderSide,
    ) -> Result<String, ProviderError> {
        self.client
            .place_order(
                instrument.symbol(),
                instrument.margin_coin(),
                quantity,
                side.as_str(),
                None,
            )
            .await
    }

    async fn place_limit_order(
        &self,
        instrument: Instrument,
        quantity: Decimal,
        side: OrderSide,
        price: Decimal,
    ) -> Result<String, ProviderError> {
        self.client
            .place_order(
                instrument.symbol(),
                instrument.margin_coin(),
                quantity,
                side.as_str(),
                Some(price),
            )
            .await
    }

    async fn cancel_order(
        &self,
        instrument: Instrument,
        order_id: &str,
    ) -> Result<(), ProviderError> {
        self.client
            .cancel_order(instrument.symbol(), instrument.margin_coin(), order_id)
            .await
    }

    async fn place_protective_order(
        &self,
        instrument: Instrument,
        plan_type: PlanType,
        trigger_price: Decimal,
        hold_side: Direction,
        quantity: Decimal,
    ) -> Result<String, ProviderError> {
        self.client
            .place_tpsl(
                instrument.symbol(),
                instrument.margin_coin(),
                quantity,
                plan_type.as_str(),
                trigger_price,
                hold_side.as_str(),
            )
            .await
    }

    async fn modify_protective_order(
        &self,
        order: &SltpOrder,
        trigger_price: Decimal,
    ) -> Result<ProtectiveOrderStatus, ProviderError> {
        self.client
            .modify_tpsl(
                order.instrument.symbol(),
                order.instrument.margin_coin(),
                order.plan_type.as_str(),
                trigger_price,
                &order.remote_id,
            )
            .await
    }

    async fn cancel_protective_order(&self, order: &SltpOrder) -> Result<(), ProviderError> {
        self.client
            .cancel_plan(
                order.instrument.symbol(),
                order.instrument.margin_coin(),
                order.plan_type.as_str(),
                &order.remote_id,
            )
            .await
    }

    async fn query_fill(
        &self,
        instrument: Instrument,
        order_id: &str,
    ) -> Result<FillDetail, ProviderError> {
        let row = self.client.first_fill(instrument.symbol(), order_id).await?;
        debug!(order_id, price = %row.price, qty = %row.size_qty, "CoinCatch 체결 조회");
        row.into_fill_detail()
    }

    async fn query_order_state(
        &self,
        instrument: Instrument,
        order_id: &str,
    ) -> Result<Option<OrderStatus>, ProviderError> {
        self.client
            .order_detail(instrument.symbol(), order_id)
            .await?
            .map(|detail| detail.into_status())
            .transpose()
    }

    async fn get_mark_price(&self, instrument: Instrument) -> Result<Decimal, ProviderError> {
        self.client.mark_price(instrument.symbol()).await
    }

    fn exchange_name(&self) -> &str {
        "coincatch"
    }
}

// ==================== ExchangeFactory ====================

/// 트레이더 자격증명으로 CoinCatch 클라이언트를 만드는 팩토리.
///
/// 모든 트레이더가 하나의 HTTP 연결 풀을 공유합니다.
#[derive(Debug, Clone)]
pub struct CoincatchExchangeFactory {
    http: Client,
    base_url: String,
}

impl CoincatchExchangeFactory {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl ExchangeFactory for CoincatchExchangeFactory {
    fn for_trader(&self, trader: &Trader) -> Arc<dyn FuturesExchange> {
        let config =
            CoincatchConfig::new(trader.credentials.clone()).with_base_url(self.base_url.clone());
        Arc::new(CoincatchExchangeProvider::new(CoincatchClient::with_client(
            self.http.clone(),
            config,
        )))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use trader_core::domain::ApiCredentials;

    use super::*;

    fn trader() -> Trader {
        Trader {
            id: 1,
            name: "alpha".to_string(),
            credentials: ApiCredentials::new("key-1", "test-secret", "pass-1"),
            pnl: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn factory_uses_trader_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/mix/v1/market/mark-price")
            .match_query(mockito::Matcher::UrlEncoded(
                "symbol".into(),
                "BTCUSDT_UMCBL".into(),
            ))
            .match_header("ACCESS-KEY", "key-1")
            .match_header("ACCESS-PASSPHRASE", "pass-1")
            .with_status(200)
            .with_body(r#"{"code":"00000","msg":"success","data":{"symbol":"BTCUSDT_UMCBL","markPrice":"61234.5"}}"#)
            .create_async()
            .await;

        let factory = CoincatchExchangeFactory::new(Client::new()).with_base_url(server.url());
        let exchange = factory.for_trader(&trader());

        let price = exchange.get_mark_price(Instrument::BtcFutures).await.unwrap();
        assert_eq!(price, dec!(61234.5));
        assert_eq!(exchange.exchange_name(), "coincatch");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn protective_order_uses_plan_type_and_hold_side() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/mix/v1/plan/placeTPSL")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"planType":"loss_plan","holdSide":"short","triggerPrice":"60300","size":"0.003"}"#
                    .to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"code":"00000","msg":"success","data":{"orderId":"555"}}"#)
            .create_async()
            .await;

        let factory = CoincatchExchangeFactory::new(Client::new()).with_base_url(server.url());
        let exchange = factory.for_trader(&trader());

        let id = exchange
            .place_protective_order(
                Instrument::BtcFutures,
                PlanType::StopLoss,
                dec!(60300.0),
                Direction::Short,
                dec!(0.003),
            )
            .await
            .unwrap();
        assert_eq!(id, "555");
        mock.assert_async().await;
    }
}
