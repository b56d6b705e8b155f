use crate::core::{
    config::ApiKeys,
    types::{Balance, FillEvent, OpenOrder, OrderRequest, Result, Ticker},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 交易所网关能力接口
/// 引擎只依赖这组操作，按交易所各自实现；所有调用从引擎视角可安全重试，
/// 去重由引擎按 exchange_order_id / fill_id 完成
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// 网关名称
    fn name(&self) -> &str;

    /// 下限价单，返回交易所订单ID
    async fn place_order(&self, request: &OrderRequest) -> Result<String>;

    /// 撤单
    async fn cancel_order(&self, exchange_order_id: &str, pair: &str) -> Result<()>;

    /// 获取当前挂单（对账时作为事实来源）
    async fn list_open_orders(&self, pair: &str) -> Result<Vec<OpenOrder>>;

    /// 拉取自某时刻以来的成交，至少送达一次
    async fn poll_fills(&self, pair: &str, since: DateTime<Utc>) -> Result<Vec<FillEvent>>;

    /// 获取行情
    async fn get_ticker(&self, pair: &str) -> Result<Ticker>;

    /// 获取账户余额
    async fn get_balances(&self) -> Result<Vec<Balance>>;

    /// 测试连接
    async fn ping(&self) -> Result<()>;

    /// 撤销指定交易对的全部挂单，返回撤单数量
    async fn cancel_all_orders(&self, pair: &str) -> Result<u32> {
        // 默认实现：逐个取消
        let open_orders = self.list_open_orders(pair).await?;
        let mut cancelled = 0u32;
        for order in open_orders {
            match self.cancel_order(&order.exchange_order_id, pair).await {
                Ok(()) => cancelled += 1,
                Err(e) => log::warn!("取消订单 {} 失败: {}", order.exchange_order_id, e),
            }
        }
        Ok(cancelled)
    }
}

/// 网关公共部分：HTTP客户端与密钥
#[derive(Clone)]
pub struct BaseGateway {
    pub name: String,
    pub api_keys: ApiKeys,
    pub client: reqwest::Client,
}

impl BaseGateway {
    /// 创建新的网关实例
    pub fn new(name: String, api_keys: ApiKeys) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("RustGrid/0.1.0")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("创建HTTP客户端失败");

        Self {
            name,
            api_keys,
            client,
        }
    }
}
