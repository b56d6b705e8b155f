use crate::core::error::GridError;
use crate::core::types::SpacingMode;
use serde::{Deserialize, Serialize};
use std::fs;

/// 网格策略主配置，启动时加载一次，会话期间不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub log_level: Option<String>,
    pub pair: PairSelectionConfig,
    pub grid: GridParams,
    pub risk: RiskParams,
    #[serde(default)]
    pub execution: ExecutionParams,
    #[serde(default)]
    pub journal: JournalParams,
    #[serde(default)]
    pub persistence: Option<PersistenceParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub name: String,
    /// kraken | coinbase | paper
    pub exchange: String,
}

/// 交易对配置：单一 trading_pair，或给出候选 pairs 由引擎评分选择
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSelectionConfig {
    #[serde(default)]
    pub trading_pair: Option<String>,
    #[serde(default)]
    pub pairs: Vec<String>,
    /// 基础资产余额键覆盖（交易所资产代码与交易对不一致时使用）
    #[serde(default)]
    pub base_balance_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParams {
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub spacing_mode: SpacingMode,
    /// 等差为价差，等比为相邻档位价格比值
    pub spacing_value: f64,
    pub order_size: OrderSizeConfig,
}

/// 单档订单规模
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSizeConfig {
    pub mode: OrderSizeMode,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSizeMode {
    /// 固定基础资产数量
    Base,
    /// 固定计价货币名义价值，按档位价格换算数量
    Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    /// 敞口上限（计价货币名义价值）
    pub max_position: f64,
    /// 当日已实现+未实现亏损上限（计价货币）
    pub max_daily_loss: f64,
    /// 价格越界容忍度（占区间宽度百分比），超过即暂停
    #[serde(default)]
    pub out_of_range_tolerance_pct: f64,
    #[serde(default = "default_max_gateway_failures")]
    pub max_consecutive_gateway_failures: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default)]
    pub cancel_on_pause: bool,
    #[serde(default = "default_true")]
    pub cancel_on_stop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionParams {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// 手续费率覆盖，缺省按交易所默认值
    #[serde(default)]
    pub fee_rate: Option<f64>,
    #[serde(default = "default_price_digits")]
    pub price_digits: u32,
    #[serde(default = "default_amount_digits")]
    pub amount_digits: u32,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            dry_run: false,
            poll_interval_secs: default_poll_interval(),
            fee_rate: None,
            price_digits: default_price_digits(),
            amount_digits: default_amount_digits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalParams {
    #[serde(default = "default_journal_dir")]
    pub dir: String,
}

impl Default for JournalParams {
    fn default() -> Self {
        Self {
            dir: default_journal_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceParams {
    pub base_url: String,
    #[serde(default = "default_persistence_timeout")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_gateway_failures() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    10
}

fn default_price_digits() -> u32 {
    2
}

fn default_amount_digits() -> u32 {
    8
}

fn default_journal_dir() -> String {
    "logs".to_string()
}

fn default_persistence_timeout() -> u64 {
    3
}

impl GridConfig {
    /// 从YAML文件加载配置
    pub fn from_file(path: &str) -> Result<Self, GridError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| GridError::ConfigError(format!("读取配置文件失败: {}", e)))?;

        let config: GridConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// 启动前的全量校验，任何一项不合法都在联网之前失败
    pub fn validate(&self) -> Result<(), GridError> {
        if self.campaign.name.trim().is_empty() {
            return Err(GridError::ConfigError("campaign.name 不能为空".to_string()));
        }
        if self.campaign.exchange.trim().is_empty() {
            return Err(GridError::ConfigError(
                "campaign.exchange 不能为空".to_string(),
            ));
        }
        if self.pair.trading_pair.is_none() && self.pair.pairs.is_empty() {
            return Err(GridError::ConfigError(
                "必须配置 pair.trading_pair 或候选 pair.pairs".to_string(),
            ));
        }

        let grid = &self.grid;
        if grid.lower_bound <= 0.0 {
            return Err(GridError::ConfigError(format!(
                "lower_bound 必须为正数: {}",
                grid.lower_bound
            )));
        }
        if grid.lower_bound >= grid.upper_bound {
            return Err(GridError::ConfigError(format!(
                "lower_bound {} 必须小于 upper_bound {}",
                grid.lower_bound, grid.upper_bound
            )));
        }
        match grid.spacing_mode {
            SpacingMode::Arithmetic => {
                if grid.spacing_value <= 0.0 {
                    return Err(GridError::ConfigError(format!(
                        "等差间距必须为正数: {}",
                        grid.spacing_value
                    )));
                }
                if grid.lower_bound + grid.spacing_value > grid.upper_bound {
                    return Err(GridError::ConfigError(
                        "网格区间至少要容纳2个档位".to_string(),
                    ));
                }
            }
            SpacingMode::Geometric => {
                if grid.spacing_value <= 1.0 {
                    return Err(GridError::ConfigError(format!(
                        "等比间距必须大于1: {}",
                        grid.spacing_value
                    )));
                }
                if grid.lower_bound * grid.spacing_value > grid.upper_bound {
                    return Err(GridError::ConfigError(
                        "网格区间至少要容纳2个档位".to_string(),
                    ));
                }
            }
        }
        if grid.order_size.value <= 0.0 {
            return Err(GridError::ConfigError(format!(
                "order_size.value 必须为正数: {}",
                grid.order_size.value
            )));
        }

        let risk = &self.risk;
        if risk.max_position <= 0.0 {
            return Err(GridError::ConfigError(format!(
                "max_position 必须为正数: {}",
                risk.max_position
            )));
        }
        if risk.max_daily_loss <= 0.0 {
            return Err(GridError::ConfigError(format!(
                "max_daily_loss 必须为正数: {}",
                risk.max_daily_loss
            )));
        }
        if risk.out_of_range_tolerance_pct < 0.0 {
            return Err(GridError::ConfigError(format!(
                "out_of_range_tolerance_pct 不能为负: {}",
                risk.out_of_range_tolerance_pct
            )));
        }
        if risk.max_consecutive_gateway_failures == 0 {
            return Err(GridError::ConfigError(
                "max_consecutive_gateway_failures 至少为1".to_string(),
            ));
        }

        if self.execution.poll_interval_secs == 0 {
            return Err(GridError::ConfigError(
                "poll_interval_secs 至少为1秒".to_string(),
            ));
        }
        if let Some(rate) = self.execution.fee_rate {
            if !(0.0..1.0).contains(&rate) {
                return Err(GridError::ConfigError(format!(
                    "fee_rate 必须在 [0, 1) 区间: {}",
                    rate
                )));
            }
        }

        Ok(())
    }

    /// 生效的手续费率：配置覆盖优先，否则按交易所默认
    pub fn effective_fee_rate(&self) -> f64 {
        if let Some(rate) = self.execution.fee_rate {
            return rate;
        }
        match self.campaign.exchange.to_lowercase().as_str() {
            "kraken" => 0.0016,
            "coinbase" => 0.0040,
            _ => 0.0016,
        }
    }

    /// 当前生效的交易对（未做自动选择前可能为空）
    pub fn resolved_pair(&self) -> Option<&str> {
        self.pair.trading_pair.as_deref()
    }
}

/// API密钥配置
#[derive(Debug, Clone)]
pub struct ApiKeys {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

impl ApiKeys {
    /// 从环境变量加载API密钥
    pub fn from_env(exchange: &str) -> Result<Self, GridError> {
        dotenv::dotenv().ok(); // 加载.env文件，忽略错误

        let exchange_upper = exchange.to_uppercase();

        let api_key = std::env::var(format!("{}_API_KEY", exchange_upper)).map_err(|_| {
            GridError::ConfigError(format!("未找到{}的API_KEY环境变量", exchange))
        })?;

        // 尝试两种格式的密钥名称
        let api_secret = std::env::var(format!("{}_API_SECRET", exchange_upper))
            .or_else(|_| std::env::var(format!("{}_SECRET_KEY", exchange_upper)))
            .or_else(|_| std::env::var(format!("{}_SECRET", exchange_upper)))
            .map_err(|_| {
                GridError::ConfigError(format!(
                    "未找到{}的API_SECRET或SECRET_KEY环境变量",
                    exchange
                ))
            })?;

        // 部分交易所需要passphrase
        let passphrase = std::env::var(format!("{}_PASSPHRASE", exchange_upper))
            .or_else(|_| std::env::var(format!("{}_API_PASSWORD", exchange_upper)))
            .ok();

        Ok(ApiKeys {
            api_key,
            api_secret,
            passphrase,
        })
    }
}
