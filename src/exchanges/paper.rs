//! 纸面交易网关
//!
//! dry-run 模式下的本地撮合实现：挂单进入内存簿，行情穿过限价即成交。
//! 引擎侧拿到的接口与真实交易所完全一致，成交同样按至少一次语义投递。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::error::GridError;
use crate::core::gateway::ExchangeGateway;
use crate::core::types::{Balance, FillEvent, OpenOrder, OrderRequest, OrderSide, Result, Ticker};

/// 簿内挂单
#[derive(Debug, Clone)]
struct RestingOrder {
    exchange_order_id: String,
    pair: String,
    side: OrderSide,
    price: f64,
    quantity: f64,
    filled_quantity: f64,
    created_at: DateTime<Utc>,
}

/// 纸面账本：最新价、挂单簿与成交流水
struct PaperBook {
    last_price: f64,
    open_orders: HashMap<String, RestingOrder>,
    fills: Vec<FillEvent>,
    balances: HashMap<String, f64>,
}

/// 纸面交易网关实现
pub struct PaperGateway {
    fee_rate: f64,
    /// 每次取行情时让价格随机游走（dry-run 主循环用）
    drift: bool,
    book: Arc<Mutex<PaperBook>>,
    order_seq: AtomicU64,
    fill_seq: Arc<AtomicU64>,
}

impl PaperGateway {
    /// 创建纸面网关并注入初始行情与模拟余额
    pub fn new(pair: &str, initial_price: f64, fee_rate: f64) -> Self {
        let mut balances = HashMap::new();
        // 模拟账户给足余额，纸面模式不做资金拦截
        let (base, quote) = split_pair(pair);
        balances.insert(quote, 1_000_000.0);
        balances.insert(base, 100.0);

        Self {
            fee_rate,
            drift: false,
            book: Arc::new(Mutex::new(PaperBook {
                last_price: initial_price,
                open_orders: HashMap::new(),
                fills: Vec::new(),
                balances,
            })),
            order_seq: AtomicU64::new(0),
            fill_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 开启行情随机游走
    pub fn with_drift(mut self) -> Self {
        self.drift = true;
        self
    }

    /// 注入一笔行情并撮合被穿过的挂单
    pub async fn set_price(&self, price: f64) {
        let mut book = self.book.lock().await;
        Self::apply_price(&mut book, price, self.fee_rate, &self.fill_seq);
    }

    /// 当前最新价
    pub async fn last_price(&self) -> f64 {
        self.book.lock().await.last_price
    }

    /// 行情更新与撮合：买单在价格跌破限价时成交，卖单在涨破限价时成交
    fn apply_price(book: &mut PaperBook, price: f64, fee_rate: f64, fill_seq: &AtomicU64) {
        book.last_price = price;

        let crossed: Vec<String> = book
            .open_orders
            .values()
            .filter(|order| match order.side {
                OrderSide::Buy => price <= order.price,
                OrderSide::Sell => price >= order.price,
            })
            .map(|order| order.exchange_order_id.clone())
            .collect();

        for exchange_order_id in crossed {
            if let Some(order) = book.open_orders.remove(&exchange_order_id) {
                let quantity = order.quantity - order.filled_quantity;
                // 按限价成交，纸面模式不模拟滑点
                let fee = order.price * quantity * fee_rate;
                let seq = fill_seq.fetch_add(1, Ordering::SeqCst) + 1;
                let fill = FillEvent {
                    fill_id: format!("paper-fill-{}", seq),
                    exchange_order_id: order.exchange_order_id.clone(),
                    pair: order.pair.clone(),
                    side: order.side,
                    price: order.price,
                    quantity,
                    fee: Some(fee),
                    timestamp: Utc::now(),
                };
                log::info!(
                    "📊 [纸面] 订单{}成交: {} {:.8} @ {:.2}",
                    order.exchange_order_id,
                    order.side,
                    quantity,
                    order.price
                );
                book.fills.push(fill);
            }
        }
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        if request.price <= 0.0 || request.quantity <= 0.0 {
            return Err(GridError::ValidationError {
                field: "price/quantity".to_string(),
                reason: format!("非法下单参数: {} @ {}", request.quantity, request.price),
            });
        }

        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let exchange_order_id = format!("paper-{}", seq);

        let mut book = self.book.lock().await;
        book.open_orders.insert(
            exchange_order_id.clone(),
            RestingOrder {
                exchange_order_id: exchange_order_id.clone(),
                pair: request.pair.clone(),
                side: request.side,
                price: request.price,
                quantity: request.quantity,
                filled_quantity: 0.0,
                created_at: Utc::now(),
            },
        );

        // 限价已被当前行情穿过时立即成交
        let last = book.last_price;
        Self::apply_price(&mut book, last, self.fee_rate, &self.fill_seq);

        Ok(exchange_order_id)
    }

    async fn cancel_order(&self, exchange_order_id: &str, pair: &str) -> Result<()> {
        let mut book = self.book.lock().await;
        match book.open_orders.remove(exchange_order_id) {
            Some(_) => Ok(()),
            None => Err(GridError::OrderNotFound {
                order_id: exchange_order_id.to_string(),
                pair: pair.to_string(),
            }),
        }
    }

    async fn list_open_orders(&self, pair: &str) -> Result<Vec<OpenOrder>> {
        let book = self.book.lock().await;
        let mut orders: Vec<OpenOrder> = book
            .open_orders
            .values()
            .filter(|order| order.pair == pair)
            .map(|order| OpenOrder {
                exchange_order_id: order.exchange_order_id.clone(),
                pair: order.pair.clone(),
                side: order.side,
                price: order.price,
                quantity: order.quantity,
                filled_quantity: order.filled_quantity,
                timestamp: order.created_at,
            })
            .collect();
        orders.sort_by(|a, b| a.exchange_order_id.cmp(&b.exchange_order_id));
        Ok(orders)
    }

    async fn poll_fills(&self, pair: &str, since: DateTime<Utc>) -> Result<Vec<FillEvent>> {
        let book = self.book.lock().await;
        // 边界取闭区间，刻意允许重复投递，由上层按 fill_id 去重
        Ok(book
            .fills
            .iter()
            .filter(|fill| fill.pair == pair && fill.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn get_ticker(&self, pair: &str) -> Result<Ticker> {
        let mut book = self.book.lock().await;

        if self.drift {
            let step = {
                use rand::Rng;
                let mut rng = rand::thread_rng();
                rng.gen_range(-0.002..0.002)
            };
            let next = book.last_price * (1.0 + step);
            Self::apply_price(&mut book, next, self.fee_rate, &self.fill_seq);
        }

        let last = book.last_price;
        Ok(Ticker {
            pair: pair.to_string(),
            high: last * 1.01,
            low: last * 0.99,
            bid: last * 0.9995,
            ask: last * 1.0005,
            last,
            volume: 1000.0,
            timestamp: Utc::now(),
        })
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        let book = self.book.lock().await;
        let mut balances: Vec<Balance> = book
            .balances
            .iter()
            .map(|(currency, amount)| Balance {
                currency: currency.clone(),
                total: *amount,
                free: *amount,
                used: 0.0,
            })
            .collect();
        balances.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(balances)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// 从 BTC/USD 形式的交易对拆出基础货币与计价货币
fn split_pair(pair: &str) -> (String, String) {
    match pair.split_once('/') {
        Some((base, quote)) => (base.to_string(), quote.to_string()),
        None => (pair.to_string(), "USD".to_string()),
    }
}
