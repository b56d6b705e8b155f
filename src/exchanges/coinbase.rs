//! Coinbase 交易所网关
//!
//! REST 实现：行情走 /products 公共端点，下单与账户走签名端点。
//! 私有请求按 Coinbase Exchange 规范签名:
//! Base64(HMAC-SHA256(timestamp + method + path + body))，并附带 Passphrase 请求头。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::core::config::ApiKeys;
use crate::core::error::GridError;
use crate::core::gateway::{BaseGateway, ExchangeGateway};
use crate::core::types::{Balance, FillEvent, OpenOrder, OrderRequest, OrderSide, Result, Ticker};
use crate::utils::SignatureHelper;

const API_BASE: &str = "https://api.exchange.coinbase.com";

/// Coinbase 网关实现
pub struct CoinbaseGateway {
    base: BaseGateway,
}

#[derive(Debug, Deserialize)]
struct CoinbaseTicker {
    price: String,
    bid: String,
    ask: String,
}

#[derive(Debug, Deserialize)]
struct CoinbaseStats {
    high: String,
    low: String,
    volume: String,
}

#[derive(Debug, Deserialize)]
struct CoinbaseOrder {
    id: String,
    price: String,
    size: String,
    side: String,
    filled_size: String,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct CoinbaseFill {
    trade_id: u64,
    order_id: String,
    price: String,
    size: String,
    fee: String,
    side: String,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct CoinbaseAccount {
    currency: String,
    balance: String,
    available: String,
    hold: String,
}

#[derive(Debug, Deserialize)]
struct CoinbaseTime {
    #[allow(dead_code)]
    epoch: f64,
}

/// 非2xx响应的错误体
#[derive(Debug, Deserialize)]
struct CoinbaseErrorBody {
    message: String,
}

impl CoinbaseGateway {
    pub fn new(api_keys: ApiKeys) -> Self {
        Self {
            base: BaseGateway::new("coinbase".to_string(), api_keys),
        }
    }

    /// 公共端点 GET
    async fn public_get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", API_BASE, path);
        let response = self.base.client.get(&url).send().await?;
        Self::decode_response(response).await
    }

    /// 私有端点：签名覆盖 timestamp + method + path(含query) + body
    async fn private_request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let passphrase = self.base.api_keys.passphrase.as_deref().ok_or_else(|| {
            GridError::AuthError(
                "Coinbase需要API Passphrase，请设置COINBASE_PASSPHRASE".to_string(),
            )
        })?;

        let timestamp = SignatureHelper::timestamp_seconds().to_string();
        let body_str = match &body {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };
        let signature = SignatureHelper::coinbase_signature(
            &self.base.api_keys.api_secret,
            &timestamp,
            method.as_str(),
            path,
            &body_str,
        )?;

        let url = format!("{}{}", API_BASE, path);
        let mut request = self
            .base
            .client
            .request(method, &url)
            .header("CB-ACCESS-KEY", &self.base.api_keys.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("CB-ACCESS-PASSPHRASE", passphrase);
        if body.is_some() {
            request = request
                .header("Content-Type", "application/json")
                .body(body_str);
        }

        let response = request.send().await?;
        Self::decode_response(response).await
    }

    /// 非2xx按状态码分类，2xx直接反序列化
    async fn decode_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_coinbase_error(status.as_u16(), &body));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ExchangeGateway for CoinbaseGateway {
    fn name(&self) -> &str {
        "coinbase"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        // post_only确保只做Maker，吃单会被交易所直接拒绝
        let body = serde_json::json!({
            "type": "limit",
            "side": side_param(request.side),
            "product_id": to_coinbase_product(&request.pair),
            "price": format!("{}", request.price),
            "size": format!("{}", request.quantity),
            "post_only": true,
        });
        let order: CoinbaseOrder = self
            .private_request(reqwest::Method::POST, "/orders", Some(body))
            .await?;
        Ok(order.id)
    }

    async fn cancel_order(&self, exchange_order_id: &str, pair: &str) -> Result<()> {
        let path = format!("/orders/{}", exchange_order_id);
        let result: std::result::Result<String, GridError> = self
            .private_request(reqwest::Method::DELETE, &path, None)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(GridError::ApiError { code: 404, .. }) => Err(GridError::OrderNotFound {
                order_id: exchange_order_id.to_string(),
                pair: pair.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn list_open_orders(&self, pair: &str) -> Result<Vec<OpenOrder>> {
        let path = format!(
            "/orders?status=open&product_id={}",
            to_coinbase_product(pair)
        );
        let raw: Vec<CoinbaseOrder> = self
            .private_request(reqwest::Method::GET, &path, None)
            .await?;

        let mut orders = Vec::new();
        for order in raw {
            orders.push(OpenOrder {
                exchange_order_id: order.id,
                pair: pair.to_string(),
                side: parse_side(&order.side)?,
                price: parse_f64(&order.price, "price")?,
                quantity: parse_f64(&order.size, "size")?,
                filled_quantity: parse_f64(&order.filled_size, "filled_size")?,
                timestamp: parse_rfc3339(&order.created_at)?,
            });
        }
        Ok(orders)
    }

    async fn poll_fills(&self, pair: &str, since: DateTime<Utc>) -> Result<Vec<FillEvent>> {
        let path = format!("/fills?product_id={}", to_coinbase_product(pair));
        let raw: Vec<CoinbaseFill> = self
            .private_request(reqwest::Method::GET, &path, None)
            .await?;

        // 返回按时间倒序，过滤后转回正序交给上层
        let mut fills = Vec::new();
        for fill in raw {
            let timestamp = parse_rfc3339(&fill.created_at)?;
            if timestamp < since {
                continue;
            }
            fills.push(FillEvent {
                fill_id: fill.trade_id.to_string(),
                exchange_order_id: fill.order_id,
                pair: pair.to_string(),
                side: parse_side(&fill.side)?,
                price: parse_f64(&fill.price, "price")?,
                quantity: parse_f64(&fill.size, "size")?,
                fee: Some(parse_f64(&fill.fee, "fee")?),
                timestamp,
            });
        }
        fills.sort_by_key(|fill| fill.timestamp);
        Ok(fills)
    }

    async fn get_ticker(&self, pair: &str) -> Result<Ticker> {
        let product = to_coinbase_product(pair);
        // ticker端点只有买卖一和最新价，高低量在stats端点
        let ticker: CoinbaseTicker = self
            .public_get(&format!("/products/{}/ticker", product))
            .await?;
        let stats: CoinbaseStats = self
            .public_get(&format!("/products/{}/stats", product))
            .await?;

        Ok(Ticker {
            pair: pair.to_string(),
            high: parse_f64(&stats.high, "high")?,
            low: parse_f64(&stats.low, "low")?,
            bid: parse_f64(&ticker.bid, "bid")?,
            ask: parse_f64(&ticker.ask, "ask")?,
            last: parse_f64(&ticker.price, "price")?,
            volume: parse_f64(&stats.volume, "volume")?,
            timestamp: Utc::now(),
        })
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        let raw: Vec<CoinbaseAccount> = self
            .private_request(reqwest::Method::GET, "/accounts", None)
            .await?;

        let mut balances = Vec::new();
        for account in raw {
            let total = parse_f64(&account.balance, "balance")?;
            if total <= 0.0 {
                continue;
            }
            balances.push(Balance {
                currency: account.currency,
                total,
                free: parse_f64(&account.available, "available")?,
                used: parse_f64(&account.hold, "hold")?,
            });
        }
        balances.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(balances)
    }

    async fn ping(&self) -> Result<()> {
        let _: CoinbaseTime = self.public_get("/time").await?;
        Ok(())
    }

    /// Coinbase有批量撤单端点，覆盖默认的逐单撤销
    async fn cancel_all_orders(&self, pair: &str) -> Result<u32> {
        let path = format!("/orders?product_id={}", to_coinbase_product(pair));
        let cancelled: Vec<String> = self
            .private_request(reqwest::Method::DELETE, &path, None)
            .await?;
        Ok(cancelled.len() as u32)
    }
}

/// BTC/USD -> BTC-USD
fn to_coinbase_product(pair: &str) -> String {
    pair.replace('/', "-")
}

fn side_param(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

fn parse_side(side: &str) -> Result<OrderSide> {
    match side {
        "buy" => Ok(OrderSide::Buy),
        "sell" => Ok(OrderSide::Sell),
        other => Err(GridError::Other(format!("未知的订单方向: {}", other))),
    }
}

fn parse_f64(value: &str, field: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| GridError::Other(format!("Coinbase字段{}不是数字: {}", field, value)))
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| GridError::Other(format!("Coinbase时间戳无法解析: {}", value)))
}

/// 错误体是 {"message": "..."}，解析失败时退回原始文本
fn extract_message(body: &str) -> String {
    serde_json::from_str::<CoinbaseErrorBody>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.to_string())
}

/// 按HTTP状态码分类：401/403认证，429限频，5xx可重试
fn classify_coinbase_error(status: u16, body: &str) -> GridError {
    let message = extract_message(body);
    match status {
        401 | 403 => GridError::AuthError(format!("Coinbase: {}", message)),
        429 => GridError::RateLimitError(format!("Coinbase: {}", message), None),
        _ => GridError::ApiError {
            code: status as i32,
            message: format!("Coinbase: {}", message),
        },
    }
}
