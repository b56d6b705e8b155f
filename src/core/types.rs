use chrono::{DateTime, Utc};
/// 统一的类型定义模块
/// 网格交易相关的基础数据结构
use serde::{Deserialize, Serialize};

// ============= 基础类型定义 =============

/// 结果类型别名
pub type Result<T> = std::result::Result<T, crate::core::error::GridError>;

/// 订单方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// 反方向（成交后补挂对手单使用）
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 网格间距模式
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpacingMode {
    /// 等差：price = lower + index * spacing
    Arithmetic,
    /// 等比：price = lower * ratio^index
    Geometric,
}

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// 终态订单不再参与任何状态流转
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Paused,
    Stopped,
}

// ============= 订单相关 =============

/// 网格订单，由账本独占持有
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOrder {
    pub id: String,
    pub level_index: usize,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub status: OrderStatus,
    pub exchange_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GridOrder {
    pub fn new(id: String, level_index: usize, side: OrderSide, price: f64, quantity: f64) -> Self {
        let now = Utc::now();
        Self {
            id,
            level_index,
            side,
            price,
            quantity,
            filled_quantity: 0.0,
            status: OrderStatus::Pending,
            exchange_order_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 剩余未成交数量
    pub fn remaining(&self) -> f64 {
        (self.quantity - self.filled_quantity).max(0.0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 下单请求（网关入参）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub pair: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn new(pair: String, side: OrderSide, price: f64, quantity: f64) -> Self {
        Self {
            pair,
            side,
            price,
            quantity,
            client_order_id: None,
        }
    }

    pub fn with_client_id(mut self, client_order_id: String) -> Self {
        self.client_order_id = Some(client_order_id);
        self
    }
}

/// 交易所侧的挂单视图（对账时以此为准）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub exchange_order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub timestamp: DateTime<Utc>,
}

// ============= 成交相关 =============

/// 成交事件，交易所至少送达一次，按 fill_id 去重
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub fill_id: String,
    pub exchange_order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    /// 交易所报告的手续费（缺省时按费率估算）
    pub fee: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl FillEvent {
    /// 成交金额（计价货币）
    pub fn cost(&self) -> f64 {
        self.price * self.quantity
    }
}

// ============= 行情与账户 =============

/// 行情数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub pair: String,
    pub high: f64,
    pub low: f64,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// 账户余额
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub total: f64,
    pub free: f64,
    pub used: f64,
}

// ============= 辅助函数 =============

/// 按小数位数四舍五入
pub fn round_price(price: f64, digits: u32) -> f64 {
    let factor = 10_f64.powi(digits as i32);
    (price * factor).round() / factor
}

/// 价格量化为整数键，避免f64直接做HashMap键
pub fn quantize_price(price: f64) -> i64 {
    (price * 1e8).round() as i64
}
