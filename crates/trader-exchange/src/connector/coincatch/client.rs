use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use trader_core::domain::{
    ApiCredentials, FillDetail, FillSide, OrderState, OrderStatus, ProtectiveOrderStatus,
    ProviderError,
};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_BASE_URL: &str = "https://api.coincatch.com";

/// 성공 응답 코드.
pub const CODE_SUCCESS: &str = "00000";

/// 보호 주문이 없음 (이미 발동되었거나 취소됨).
pub const CODE_PLAN_ORDER_NOT_FOUND: &str = "43020";

const PATH_PLACE_ORDER: &str = "/api/mix/v1/order/placeOrder";
const PATH_CANCEL_ORDER: &str = "/api/mix/v1/order/cancel-order";
const PATH_ORDER_FILLS: &str = "/api/mix/v1/order/fills";
const PATH_ORDER_DETAIL: &str = "/api/mix/v1/order/detail";
const PATH_PLACE_TPSL: &str = "/api/mix/v1/plan/placeTPSL";
const PATH_MODIFY_TPSL: &str = "/api/mix/v1/plan/modifyTPSLPlan";
const PATH_CANCEL_PLAN: &str = "/api/mix/v1/plan/cancelPlan";
const PATH_MARK_PRICE: &str = "/api/mix/v1/market/mark-price";

// ============================================================================
// 설정
// ============================================================================

#[derive(Clone)]
pub struct CoincatchConfig {
    pub credentials: ApiCredentials,
    pub base_url: String,
}

impl std::fmt::Debug for CoincatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoincatchConfig")
            .field("credentials", &"***")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl CoincatchConfig {
    pub fn new(credentials: ApiCredentials) -> Self {
        Self {
            credentials,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

// ============================================================================
// 서명
// ============================================================================

/// 서명 대상 페이로드.
#[derive(Debug, Clone, Copy)]
pub enum SignPayload<'a> {
    /// POST 본문 (JSON 문자열)
    Body(&'a str),
    /// GET 쿼리 문자열 (`?` 제외)
    Query(&'a str),
}

/// 서명 원문: `timestamp + METHOD + path + (body | "?" + query)`.
pub fn pre_hash(timestamp: &str, method: &Method, request_path: &str, payload: SignPayload<'_>) -> String {
    let mut message = format!("{}{}{}", timestamp, method.as_str().to_uppercase(), request_path);
    match payload {
        SignPayload::Body(body) => message.push_str(body),
        SignPayload::Query(query) if !query.is_empty() => {
            message.push('?');
            message.push_str(query);
        }
        SignPayload::Query(_) => {}
    }
    message
}

/// HMAC-SHA256 서명 (base64).
pub fn sign(secret: &str, message: &str) -> Result<String, ProviderError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ProviderError::Authentication(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

// ============================================================================
// API 요청/응답 타입
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderBody<'a> {
    symbol: &'a str,
    margin_coin: &'a str,
    size: String,
    side: &'a str,
    order_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_in_force_value: Option<&'a str>,
    client_oid: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaceTpslBody<'a> {
    symbol: &'a str,
    margin_coin: &'a str,
    size: String,
    plan_type: &'a str,
    trigger_price: String,
    hold_side: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyTpslBody<'a> {
    symbol: &'a str,
    margin_coin: &'a str,
    plan_type: &'a str,
    trigger_price: String,
    order_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelPlanBody<'a> {
    symbol: &'a str,
    margin_coin: &'a str,
    plan_type: &'a str,
    order_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelOrderBody<'a> {
    symbol: &'a str,
    margin_coin: &'a str,
    order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct OrderIdData {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct MarkPriceData {
    #[serde(rename = "markPrice")]
    mark_price: Decimal,
}

/// 체결 내역 1행.
#[derive(Debug, Clone, Deserialize)]
pub struct FillRow {
    pub price: Decimal,
    #[serde(rename = "sizeQty")]
    pub size_qty: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    #[serde(default)]
    pub profit: Decimal,
    pub side: String,
    #[serde(rename = "cTime")]
    pub c_time: String,
}

impl FillRow {
    pub fn into_fill_detail(self) -> Result<FillDetail, ProviderError> {
        let millis = i64::from_str(&self.c_time)
            .map_err(|e| ProviderError::Parse(format!("cTime '{}': {}", self.c_time, e)))?;
        let filled_at = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| ProviderError::Parse(format!("cTime 범위 초과: {}", millis)))?;

        let side = FillSide::from_exchange(&self.side);
        if side == FillSide::Unknown {
            warn!(side = %self.side, "알 수 없는 체결 방향");
        }

        Ok(FillDetail {
            price: self.price,
            quantity: self.size_qty,
            fee: self.fee,
            profit: self.profit,
            side,
            filled_at,
        })
    }
}

/// 주문 상세.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderDetail {
    pub state: String,
    #[serde(rename = "filledQty", default)]
    pub filled_qty: Option<Decimal>,
}

impl OrderDetail {
    pub fn into_status(self) -> Result<OrderStatus, ProviderError> {
        let state = OrderState::from_exchange(&self.state)
            .ok_or_else(|| ProviderError::Parse(format!("알 수 없는 주문 상태: {}", self.state)))?;
        Ok(OrderStatus {
            state,
            filled_quantity: self.filled_qty.unwrap_or(Decimal::ZERO),
        })
    }
}

fn format_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

// ============================================================================
// CoinCatch 클라이언트
// ============================================================================

pub struct CoincatchClient {
    client: Client,
    config: CoincatchConfig,
}

impl CoincatchClient {
    pub fn new(config: CoincatchConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    /// 연결 풀을 공유하는 HTTP 클라이언트로 생성.
    pub fn with_client(client: Client, config: CoincatchConfig) -> Self {
        Self { client, config }
    }

    /// 서명된 요청 실행 후 응답 envelope 의 `data` 를 역직렬화.
    ///
    /// 타임스탬프는 호출마다 새로 생성합니다.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        body: Option<&str>,
    ) -> Result<T, ProviderError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let payload = match (query, body) {
            (Some(q), _) => SignPayload::Query(q),
            (None, Some(b)) => SignPayload::Body(b),
            (None, None) => SignPayload::Body(""),
        };
        let signature = sign(
            &self.config.credentials.secret_key,
            &pre_hash(&timestamp, &method, path, payload),
        )?;

        let url = match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.config.base_url, path, q),
            _ => format!("{}{}", self.config.base_url, path),
        };

        let mut builder = self
            .client
            .request(method.clone(), &url)
            .header("ACCESS-KEY", &self.config.credentials.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", &timestamp)
            .header("ACCESS-PASSPHRASE", &self.config.credentials.passphrase)
            .header("Content-Type", "application/json")
            .header("locale", "en-US");
        if let Some(b) = body {
            builder = builder.body(b.to_string());
        }

        debug!(%method, path, "CoinCatch 요청");

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let envelope: ApiEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(ProviderError::Parse(format!(
                    "Failed to parse CoinCatch response: {}. Body: {}",
                    e, text
                )))
            }
            Err(_) => {
                return Err(ProviderError::Api {
                    code: status.as_str().to_string(),
                    message: text,
                })
            }
        };

        if envelope.code != CODE_SUCCESS {
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ProviderError::Authentication(format!(
                    "[{}] {}",
                    envelope.code, envelope.msg
                )));
            }
            return Err(ProviderError::Api {
                code: envelope.code,
                message: envelope.msg,
            });
        }

        serde_json::from_value(envelope.data).map_err(|e| {
            ProviderError::Parse(format!("Failed to parse CoinCatch data ({}): {}", path, e))
        })
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let body = serde_json::to_string(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
        self.request(Method::POST, path, None, Some(&body)).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let query =
            serde_urlencoded::to_string(params).map_err(|e| ProviderError::Parse(e.to_string()))?;
        self.request(Method::GET, path, Some(&query), None).await
    }
}

// ============================================================================
// 주문 메서드
// ============================================================================

impl CoincatchClient {
    /// 주문 생성 (POST placeOrder). `price`가 있으면 지정가, 없으면 시장가.
    pub async fn place_order(
        &self,
        symbol: &str,
        margin_coin: &str,
        size: Decimal,
        side: &str,
        price: Option<Decimal>,
    ) -> Result<String, ProviderError> {
        let body = PlaceOrderBody {
            symbol,
            margin_coin,
            size: format_decimal(size),
            side,
            order_type: if price.is_some() { "limit" } else { "market" },
            price: price.map(format_decimal),
            time_in_force_value: price.map(|_| "normal"),
            client_oid: Uuid::new_v4().to_string(),
        };
        let data: OrderIdData = self.post(PATH_PLACE_ORDER, &body).await?;
        Ok(data.order_id)
    }

    /// 일반 주문 취소.
    pub async fn cancel_order(
        &self,
        symbol: &str,
        margin_coin: &str,
        order_id: &str,
    ) -> Result<(), ProviderError> {
        let body = CancelOrderBody {
            symbol,
            margin_coin,
            order_id,
        };
        let _: serde_json::Value = self.post(PATH_CANCEL_ORDER, &body).await?;
        Ok(())
    }

    /// 첫 번째 체결 내역 조회. 체결 내역이 비어있으면 `NotFound`.
    pub async fn first_fill(&self, symbol: &str, order_id: &str) -> Result<FillRow, ProviderError> {
        let rows: Option<Vec<FillRow>> = self
            .get(PATH_ORDER_FILLS, &[("symbol", symbol), ("orderId", order_id)])
            .await?;
        rows.and_then(|rows| rows.into_iter().next())
            .ok_or_else(|| ProviderError::NotFound(format!("order {} fills", order_id)))
    }

    /// 주문 상세 조회. 주문이 없으면 `None`.
    pub async fn order_detail(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderDetail>, ProviderError> {
        self.get(PATH_ORDER_DETAIL, &[("symbol", symbol), ("orderId", order_id)])
            .await
    }

    /// 보호 주문 배치 (POST placeTPSL).
    pub async fn place_tpsl(
        &self,
        symbol: &str,
        margin_coin: &str,
        size: Decimal,
        plan_type: &str,
        trigger_price: Decimal,
        hold_side: &str,
    ) -> Result<String, ProviderError> {
        let body = PlaceTpslBody {
            symbol,
            margin_coin,
            size: format_decimal(size),
            plan_type,
            trigger_price: format_decimal(trigger_price),
            hold_side,
        };
        let data: OrderIdData = self.post(PATH_PLACE_TPSL, &body).await?;
        Ok(data.order_id)
    }

    /// 보호 주문 트리거 가격 정정.
    ///
    /// 거래소가 `43020` 을 돌려주면 주문이 이미 발동된 것으로 봅니다.
    pub async fn modify_tpsl(
        &self,
        symbol: &str,
        margin_coin: &str,
        plan_type: &str,
        trigger_price: Decimal,
        order_id: &str,
    ) -> Result<ProtectiveOrderStatus, ProviderError> {
        let body = ModifyTpslBody {
            symbol,
            margin_coin,
            plan_type,
            trigger_price: format_decimal(trigger_price),
            order_id,
        };
        match self
            .post::<serde_json::Value, _>(PATH_MODIFY_TPSL, &body)
            .await
        {
            Ok(_) => Ok(ProtectiveOrderStatus::Confirmed),
            Err(e) if e.api_code() == Some(CODE_PLAN_ORDER_NOT_FOUND) => {
                Ok(ProtectiveOrderStatus::Triggered)
            }
            Err(e) => Err(e),
        }
    }

    /// 보호 주문 취소.
    pub async fn cancel_plan(
        &self,
        symbol: &str,
        margin_coin: &str,
        plan_type: &str,
        order_id: &str,
    ) -> Result<(), ProviderError> {
        let body = CancelPlanBody {
            symbol,
            margin_coin,
            plan_type,
            order_id,
        };
        let _: serde_json::Value = self.post(PATH_CANCEL_PLAN, &body).await?;
        Ok(())
    }

    /// 마크 가격 조회.
    pub async fn mark_price(&self, symbol: &str) -> Result<Decimal, ProviderError> {
        let data: MarkPriceData = self.get(PATH_MARK_PRICE, &[("symbol", symbol)]).await?;
        Ok(data.mark_price)
    }
}
