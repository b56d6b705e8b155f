// 交易所网关实现
pub mod coinbase;
pub mod kraken;
pub mod paper;

// 导出网关实现
pub use coinbase::CoinbaseGateway;
pub use kraken::KrakenGateway;
pub use paper::PaperGateway;

use std::sync::Arc;

use crate::core::config::{ApiKeys, GridConfig};
use crate::core::error::GridError;
use crate::core::gateway::ExchangeGateway;
use crate::core::types::Result;

/// 按配置创建网关。dry_run强制走纸面撮合，初始价取网格区间中点。
pub fn create_gateway(config: &GridConfig, pair: &str) -> Result<Arc<dyn ExchangeGateway>> {
    let exchange = config.campaign.exchange.to_lowercase();
    if config.execution.dry_run || exchange == "paper" {
        let midpoint = (config.grid.lower_bound + config.grid.upper_bound) / 2.0;
        let gateway = PaperGateway::new(pair, midpoint, config.effective_fee_rate()).with_drift();
        return Ok(Arc::new(gateway));
    }

    match exchange.as_str() {
        "kraken" => {
            let keys = ApiKeys::from_env("kraken")?;
            Ok(Arc::new(KrakenGateway::new(keys)))
        }
        "coinbase" => {
            let keys = ApiKeys::from_env("coinbase")?;
            Ok(Arc::new(CoinbaseGateway::new(keys)))
        }
        other => Err(GridError::UnsupportedExchange(other.to_string())),
    }
}
