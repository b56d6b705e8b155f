// 核心模块 - 配置、错误、类型与网关能力
pub mod config;
pub mod error;
pub mod gateway;
pub mod retry_policy;
pub mod types;

pub use config::*;
pub use error::*;
pub use gateway::{BaseGateway, ExchangeGateway};
pub use retry_policy::{retry_async, ExponentialBackoffRetry, RetryConfig};
pub use types::{
    Balance, FillEvent, GridOrder, OpenOrder, OrderRequest, OrderSide, OrderStatus, Result,
    SessionStatus, SpacingMode, Ticker,
};
