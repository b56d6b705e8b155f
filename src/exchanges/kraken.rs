//! Kraken 交易所网关
//!
//! REST 实现：行情走 /0/public，下单与账户走 /0/private。
//! 私有请求按 Kraken 规范签名: Base64(HMAC-SHA512(path + SHA256(nonce + postdata)))。

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;

use crate::core::config::ApiKeys;
use crate::core::error::GridError;
use crate::core::gateway::{BaseGateway, ExchangeGateway};
use crate::core::types::{Balance, FillEvent, OpenOrder, OrderRequest, OrderSide, Result, Ticker};
use crate::utils::SignatureHelper;

const API_BASE: &str = "https://api.kraken.com";

/// Kraken 网关实现
pub struct KrakenGateway {
    base: BaseGateway,
}

/// 所有端点共用的响应信封
#[derive(Debug, Deserialize)]
struct KrakenEnvelope<T> {
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct KrakenTickerInfo {
    /// 卖一 [价, 整手量, 量]
    a: Vec<String>,
    /// 买一
    b: Vec<String>,
    /// 最新成交 [价, 量]
    c: Vec<String>,
    /// 成交量 [今日, 24小时]
    v: Vec<String>,
    /// 最高价 [今日, 24小时]
    h: Vec<String>,
    /// 最低价 [今日, 24小时]
    l: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KrakenOrderDescr {
    pair: String,
    #[serde(rename = "type")]
    side: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct KrakenOpenOrder {
    descr: KrakenOrderDescr,
    vol: String,
    vol_exec: String,
    opentm: f64,
}

#[derive(Debug, Deserialize)]
struct KrakenOpenOrdersResult {
    open: HashMap<String, KrakenOpenOrder>,
}

#[derive(Debug, Deserialize)]
struct KrakenAddOrderResult {
    txid: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KrakenCancelResult {
    count: u32,
}

#[derive(Debug, Deserialize)]
struct KrakenTrade {
    ordertxid: String,
    pair: String,
    time: f64,
    #[serde(rename = "type")]
    side: String,
    price: String,
    fee: String,
    vol: String,
}

#[derive(Debug, Deserialize)]
struct KrakenTradesResult {
    trades: HashMap<String, KrakenTrade>,
}

#[derive(Debug, Deserialize)]
struct KrakenTimeResult {
    #[allow(dead_code)]
    unixtime: i64,
}

impl KrakenGateway {
    pub fn new(api_keys: ApiKeys) -> Self {
        Self {
            base: BaseGateway::new("kraken".to_string(), api_keys),
        }
    }

    /// 公共端点 GET
    async fn public_get<T: DeserializeOwned>(&self, path: &str, query: &str) -> Result<T> {
        let url = if query.is_empty() {
            format!("{}{}", API_BASE, path)
        } else {
            format!("{}{}?{}", API_BASE, path, query)
        };
        let response = self.base.client.get(&url).send().await?;
        Self::unwrap_envelope(response).await
    }

    /// 私有端点 POST：nonce 进表单，签名进请求头
    async fn private_post<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let nonce = SignatureHelper::timestamp().to_string();
        let mut postdata = format!("nonce={}", nonce);
        for (key, value) in params {
            postdata.push('&');
            postdata.push_str(key);
            postdata.push('=');
            postdata.push_str(&SignatureHelper::url_encode(value));
        }

        let signature = SignatureHelper::kraken_signature(
            &self.base.api_keys.api_secret,
            path,
            &nonce,
            &postdata,
        )?;

        let url = format!("{}{}", API_BASE, path);
        let response = self
            .base
            .client
            .post(&url)
            .header("API-Key", &self.base.api_keys.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    /// 解开 {error, result} 信封，非空error映射到具体错误类型
    async fn unwrap_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GridError::ApiError {
                code: status.as_u16() as i32,
                message: format!("Kraken HTTP {}: {}", status, body),
            });
        }

        let envelope: KrakenEnvelope<T> = response.json().await?;
        if let Some(message) = envelope.error.first() {
            return Err(classify_kraken_error(message));
        }
        envelope
            .result
            .ok_or_else(|| GridError::Other("Kraken响应缺少result字段".to_string()))
    }
}

#[async_trait]
impl ExchangeGateway for KrakenGateway {
    fn name(&self) -> &str {
        "kraken"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        let params = [
            ("pair", to_kraken_pair(&request.pair)),
            ("type", side_param(request.side).to_string()),
            ("ordertype", "limit".to_string()),
            ("price", format!("{}", request.price)),
            ("volume", format!("{}", request.quantity)),
        ];
        let result: KrakenAddOrderResult = self.private_post("/0/private/AddOrder", &params).await?;
        result
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| GridError::OrderError("Kraken未返回订单ID".to_string()))
    }

    async fn cancel_order(&self, exchange_order_id: &str, pair: &str) -> Result<()> {
        let params = [("txid", exchange_order_id.to_string())];
        let result: KrakenCancelResult =
            self.private_post("/0/private/CancelOrder", &params).await?;
        if result.count == 0 {
            return Err(GridError::OrderNotFound {
                order_id: exchange_order_id.to_string(),
                pair: pair.to_string(),
            });
        }
        Ok(())
    }

    async fn list_open_orders(&self, pair: &str) -> Result<Vec<OpenOrder>> {
        let result: KrakenOpenOrdersResult = self.private_post("/0/private/OpenOrders", &[]).await?;
        let mut orders = Vec::new();
        for (txid, order) in result.open {
            if !pair_matches(&order.descr.pair, pair) {
                continue;
            }
            orders.push(OpenOrder {
                exchange_order_id: txid,
                pair: pair.to_string(),
                side: parse_side(&order.descr.side)?,
                price: parse_f64(&order.descr.price, "descr.price")?,
                quantity: parse_f64(&order.vol, "vol")?,
                filled_quantity: parse_f64(&order.vol_exec, "vol_exec")?,
                timestamp: epoch_to_datetime(order.opentm),
            });
        }
        Ok(orders)
    }

    async fn poll_fills(&self, pair: &str, since: DateTime<Utc>) -> Result<Vec<FillEvent>> {
        let start = format!("{:.3}", since.timestamp_millis() as f64 / 1000.0);
        let params = [("start", start)];
        let result: KrakenTradesResult =
            self.private_post("/0/private/TradesHistory", &params).await?;

        let mut fills = Vec::new();
        for (trade_id, trade) in result.trades {
            if !pair_matches(&trade.pair, pair) {
                continue;
            }
            let timestamp = epoch_to_datetime(trade.time);
            if timestamp < since {
                continue;
            }
            fills.push(FillEvent {
                fill_id: trade_id,
                exchange_order_id: trade.ordertxid,
                pair: pair.to_string(),
                side: parse_side(&trade.side)?,
                price: parse_f64(&trade.price, "price")?,
                quantity: parse_f64(&trade.vol, "vol")?,
                fee: Some(parse_f64(&trade.fee, "fee")?),
                timestamp,
            });
        }
        fills.sort_by_key(|fill| fill.timestamp);
        Ok(fills)
    }

    async fn get_ticker(&self, pair: &str) -> Result<Ticker> {
        let query = format!("pair={}", to_kraken_pair(pair));
        let result: HashMap<String, KrakenTickerInfo> =
            self.public_get("/0/public/Ticker", &query).await?;
        let info = result
            .into_values()
            .next()
            .ok_or_else(|| GridError::Other(format!("Kraken未返回{}的行情", pair)))?;

        Ok(Ticker {
            pair: pair.to_string(),
            high: parse_f64(nth(&info.h, 1, "h")?, "high")?,
            low: parse_f64(nth(&info.l, 1, "l")?, "low")?,
            bid: parse_f64(nth(&info.b, 0, "b")?, "bid")?,
            ask: parse_f64(nth(&info.a, 0, "a")?, "ask")?,
            last: parse_f64(nth(&info.c, 0, "c")?, "last")?,
            volume: parse_f64(nth(&info.v, 1, "v")?, "volume")?,
            timestamp: Utc::now(),
        })
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        let result: HashMap<String, String> = self.private_post("/0/private/Balance", &[]).await?;
        let mut balances = Vec::new();
        for (asset, amount) in result {
            let total = parse_f64(&amount, "balance")?;
            if total <= 0.0 {
                continue;
            }
            balances.push(Balance {
                currency: normalize_asset(&asset),
                total,
                free: total,
                used: 0.0,
            });
        }
        balances.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(balances)
    }

    async fn ping(&self) -> Result<()> {
        let _: KrakenTimeResult = self.public_get("/0/public/Time", "").await?;
        Ok(())
    }
}

/// BTC/USD -> XBTUSD（Kraken把BTC记作XBT）
fn to_kraken_pair(pair: &str) -> String {
    pair.replace("BTC", "XBT").replace('/', "")
}

/// 响应里的交易对键可能带X/Z前缀（如XXBTZUSD），按两条腿宽松匹配
fn pair_matches(kraken_pair: &str, wanted: &str) -> bool {
    match wanted.split_once('/') {
        Some((base, quote)) => {
            let base = if base == "BTC" { "XBT" } else { base };
            kraken_pair.contains(base) && kraken_pair.contains(quote)
        }
        None => kraken_pair == to_kraken_pair(wanted),
    }
}

/// Kraken资产代码还原为通用代码（XXBT -> BTC, ZUSD -> USD）
fn normalize_asset(asset: &str) -> String {
    let trimmed = if asset.len() == 4 && (asset.starts_with('X') || asset.starts_with('Z')) {
        &asset[1..]
    } else {
        asset
    };
    if trimmed == "XBT" {
        "BTC".to_string()
    } else {
        trimmed.to_string()
    }
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
        .map_err(|_| GridError::Other(format!("Kraken字段{}不是数字: {}", field, value)))
}

fn nth<'a>(values: &'a [String], index: usize, field: &str) -> Result<&'a str> {
    values
        .get(index)
        .map(|s| s.as_str())
        .ok_or_else(|| GridError::Other(format!("Kraken行情字段{}长度不足", field)))
}

/// 秒级（含小数）时间戳转DateTime
fn epoch_to_datetime(epoch: f64) -> DateTime<Utc> {
    let secs = epoch.trunc() as i64;
    let nanos = (epoch.fract() * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_else(Utc::now)
}

/// 错误串按前缀分类：EAPI是认证，EService可重试，EOrder是订单被拒
fn classify_kraken_error(message: &str) -> GridError {
    if message.starts_with("EAPI") {
        GridError::AuthError(format!("Kraken: {}", message))
    } else if message.contains("Rate limit") || message.contains("Too many requests") {
        GridError::RateLimitError(format!("Kraken: {}", message), None)
    } else if message.starts_with("EService") {
        GridError::ApiError {
            code: 503,
            message: format!("Kraken: {}", message),
        }
    } else if message.starts_with("EOrder") {
        GridError::OrderError(format!("Kraken: {}", message))
    } else {
        GridError::ApiError {
            code: 400,
            message: format!("Kraken: {}", message),
        }
    }
}
