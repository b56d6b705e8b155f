use crate::core::config::{GridConfig, OrderSizeMode};
use crate::core::error::GridError;
use crate::core::types::{round_price, OrderSide, Result, SpacingMode};
use serde::{Deserialize, Serialize};

/// 网格档位，阶梯建成后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: usize,
    pub price: f64,
    /// 建仓时刻相对参考价的初始方向；档位上后续的对手单方向以订单为准
    pub side: OrderSide,
}

/// 价格阶梯：严格递增的档位序列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLadder {
    levels: Vec<GridLevel>,
    pub reference_price: f64,
    pub spacing_mode: SpacingMode,
    pub spacing_value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl GridLadder {
    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// 网格区间数（档位数-1），按区间报告网格规模
    pub fn interval_count(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    pub fn level(&self, index: usize) -> Option<&GridLevel> {
        self.levels.get(index)
    }

    pub fn buy_levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.iter().filter(|l| l.side == OrderSide::Buy)
    }

    pub fn sell_levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.iter().filter(|l| l.side == OrderSide::Sell)
    }

    /// 某档位成交后对手单的目标档位：买单上移一档，卖单下移一档
    /// 越出阶梯边界时返回None（网格的自然边界行为）
    pub fn counter_index(&self, filled_index: usize, filled_side: OrderSide) -> Option<usize> {
        match filled_side {
            OrderSide::Buy => {
                let next = filled_index + 1;
                if next < self.levels.len() {
                    Some(next)
                } else {
                    None
                }
            }
            OrderSide::Sell => filled_index.checked_sub(1),
        }
    }

    /// 距给定价格最近的档位（对账时把交易所订单挂回阶梯用）
    pub fn nearest_index(&self, price: f64) -> Option<usize> {
        self.levels
            .iter()
            .min_by(|a, b| {
                let da = (a.price - price).abs();
                let db = (b.price - price).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|l| l.index)
    }
}

/// 根据配置与参考价构建阶梯：参考价之下为买档，之上（含相等）为卖档
/// 纯函数，同样输入必得同样阶梯，崩溃恢复依赖这一点
pub fn build_ladder(config: &GridConfig, reference_price: f64) -> Result<GridLadder> {
    let grid = &config.grid;

    if reference_price <= 0.0 {
        return Err(GridError::ConfigError(format!(
            "参考价格必须大于0: {}",
            reference_price
        )));
    }
    if grid.lower_bound <= 0.0 || grid.lower_bound >= grid.upper_bound {
        return Err(GridError::ConfigError(format!(
            "网格边界不合法: [{}, {}]",
            grid.lower_bound, grid.upper_bound
        )));
    }

    let price_digits = config.execution.price_digits;
    let mut rungs: Vec<f64> = Vec::new();

    match grid.spacing_mode {
        SpacingMode::Arithmetic => {
            if grid.spacing_value <= 0.0 {
                return Err(GridError::ConfigError(format!(
                    "等差间距必须为正数: {}",
                    grid.spacing_value
                )));
            }
            let tolerance = grid.spacing_value * 1e-9;
            let mut idx = 0u32;
            loop {
                let price = grid.lower_bound + grid.spacing_value * idx as f64;
                if price > grid.upper_bound + tolerance {
                    break;
                }
                rungs.push(round_price(price, price_digits));
                idx += 1;
            }
        }
        SpacingMode::Geometric => {
            if grid.spacing_value <= 1.0 {
                return Err(GridError::ConfigError(format!(
                    "等比间距必须大于1: {}",
                    grid.spacing_value
                )));
            }
            let tolerance = grid.upper_bound * 1e-9;
            let mut idx = 0i32;
            loop {
                let price = grid.lower_bound * grid.spacing_value.powi(idx);
                if price > grid.upper_bound + tolerance {
                    break;
                }
                rungs.push(round_price(price, price_digits));
                idx += 1;
            }
        }
    }

    if rungs.len() < 2 {
        return Err(GridError::ConfigError(format!(
            "网格区间内档位不足2个: [{}, {}] 间距 {}",
            grid.lower_bound, grid.upper_bound, grid.spacing_value
        )));
    }

    let levels = rungs
        .into_iter()
        .enumerate()
        .map(|(index, price)| GridLevel {
            index,
            price,
            side: if price < reference_price {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
        })
        .collect();

    Ok(GridLadder {
        levels,
        reference_price,
        spacing_mode: grid.spacing_mode,
        spacing_value: grid.spacing_value,
        lower_bound: grid.lower_bound,
        upper_bound: grid.upper_bound,
    })
}

/// 档位下单数量：固定基础数量，或按档位价格把固定名义金额换算成数量
pub fn quantity_for_level(config: &GridConfig, level_price: f64) -> f64 {
    let size = &config.grid.order_size;
    let raw = match size.mode {
        OrderSizeMode::Base => size.value,
        OrderSizeMode::Quote => size.value / level_price,
    };
    crate::core::types::round_price(raw, config.execution.amount_digits)
}

/// 单个完整网格周期（买入+对手卖出）的收益估算
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleEstimate {
    pub buy_price: f64,
    pub sell_price: f64,
    pub quantity: f64,
    pub gross_profit: f64,
    pub fees: f64,
    pub net_profit: f64,
}

/// 以参考价下方最近的买档及其对手卖档为代表，估算每周期的收益
pub fn estimate_cycle_profit(config: &GridConfig, ladder: &GridLadder) -> Option<CycleEstimate> {
    let top_buy = ladder.buy_levels().last()?;
    let counter = ladder.counter_index(top_buy.index, OrderSide::Buy)?;
    let sell_level = ladder.level(counter)?;

    let quantity = quantity_for_level(config, top_buy.price);
    let gross_profit = (sell_level.price - top_buy.price) * quantity;
    let fee_rate = config.effective_fee_rate();
    let fees = fee_rate * quantity * (top_buy.price + sell_level.price);

    Some(CycleEstimate {
        buy_price: top_buy.price,
        sell_price: sell_level.price,
        quantity,
        gross_profit,
        fees,
        net_profit: gross_profit - fees,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        CampaignConfig, ExecutionParams, GridParams, JournalParams, OrderSizeConfig,
        PairSelectionConfig, RiskParams,
    };

    fn sample_config() -> GridConfig {
        GridConfig {
            campaign: CampaignConfig {
                name: "btc-grid".to_string(),
                exchange: "kraken".to_string(),
            },
            log_level: None,
            pair: PairSelectionConfig {
                trading_pair: Some("BTC/USD".to_string()),
                pairs: Vec::new(),
                base_balance_key: None,
            },
            grid: GridParams {
                lower_bound: 25000.0,
                upper_bound: 35000.0,
                spacing_mode: SpacingMode::Arithmetic,
                spacing_value: 1000.0,
                order_size: OrderSizeConfig {
                    mode: OrderSizeMode::Base,
                    value: 0.001,
                },
            },
            risk: RiskParams {
                max_position: 500.0,
                max_daily_loss: 150.0,
                out_of_range_tolerance_pct: 0.0,
                max_consecutive_gateway_failures: 5,
                failure_window_secs: 60,
                cancel_on_pause: false,
                cancel_on_stop: true,
            },
            execution: ExecutionParams::default(),
            journal: JournalParams::default(),
            persistence: None,
        }
    }

    #[test]
    fn test_ladder_splits_sides_around_reference() {
        let config = sample_config();
        let ladder = build_ladder(&config, 29500.0).unwrap();

        assert_eq!(ladder.len(), 11);
        assert_eq!(ladder.interval_count(), 10);

        let buy_prices: Vec<f64> = ladder.buy_levels().map(|l| l.price).collect();
        let sell_prices: Vec<f64> = ladder.sell_levels().map(|l| l.price).collect();

        assert_eq!(
            buy_prices,
            vec![25000.0, 26000.0, 27000.0, 28000.0, 29000.0]
        );
        assert_eq!(
            sell_prices,
            vec![30000.0, 31000.0, 32000.0, 33000.0, 34000.0, 35000.0]
        );
    }

    #[test]
    fn test_arithmetic_spacing_is_constant() {
        let config = sample_config();
        let ladder = build_ladder(&config, 29500.0).unwrap();

        for pair in ladder.levels().windows(2) {
            assert!((pair[1].price - pair[0].price - 1000.0).abs() < 1e-9);
            assert!(pair[1].price > pair[0].price);
        }
    }

    #[test]
    fn test_geometric_ratio_is_constant() {
        let mut config = sample_config();
        config.grid.lower_bound = 1500.0;
        config.grid.upper_bound = 2500.0;
        config.grid.spacing_mode = SpacingMode::Geometric;
        config.grid.spacing_value = 1.02;
        config.execution.price_digits = 6;

        let ladder = build_ladder(&config, 2000.0).unwrap();
        assert!(ladder.len() >= 2);
        assert!(ladder.levels().last().unwrap().price <= 2500.0);

        for pair in ladder.levels().windows(2) {
            let ratio = pair[1].price / pair[0].price;
            assert!((ratio - 1.02).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rung_equal_to_reference_is_sell_side() {
        let config = sample_config();
        let ladder = build_ladder(&config, 30000.0).unwrap();

        let boundary = ladder
            .levels()
            .iter()
            .find(|l| l.price == 30000.0)
            .unwrap();
        assert_eq!(boundary.side, OrderSide::Sell);
        assert_eq!(ladder.buy_levels().count(), 5);
        assert_eq!(ladder.sell_levels().count(), 6);
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let mut config = sample_config();
        config.grid.lower_bound = 36000.0;
        assert!(build_ladder(&config, 29500.0).is_err());
    }

    #[test]
    fn test_rejects_single_level_grid() {
        let mut config = sample_config();
        config.grid.spacing_value = 50000.0;
        assert!(build_ladder(&config, 29500.0).is_err());
    }

    #[test]
    fn test_counter_index_moves_one_spacing() {
        let config = sample_config();
        let ladder = build_ladder(&config, 29500.0).unwrap();

        // 29000买单成交 -> 30000卖出
        assert_eq!(ladder.counter_index(4, OrderSide::Buy), Some(5));
        // 30000卖单成交 -> 29000买入
        assert_eq!(ladder.counter_index(5, OrderSide::Sell), Some(4));
        // 阶梯边缘：跳过
        assert_eq!(ladder.counter_index(0, OrderSide::Sell), None);
        assert_eq!(ladder.counter_index(10, OrderSide::Buy), None);
    }

    #[test]
    fn test_nearest_index() {
        let config = sample_config();
        let ladder = build_ladder(&config, 29500.0).unwrap();

        assert_eq!(ladder.nearest_index(29100.0), Some(4));
        assert_eq!(ladder.nearest_index(24000.0), Some(0));
        assert_eq!(ladder.nearest_index(40000.0), Some(10));
    }

    #[test]
    fn test_quote_sizing_converts_to_base_quantity() {
        let mut config = sample_config();
        config.grid.order_size = OrderSizeConfig {
            mode: OrderSizeMode::Quote,
            value: 50.0,
        };
        let qty = quantity_for_level(&config, 2000.0);
        assert!((qty - 0.025).abs() < 1e-12);
    }

    #[test]
    fn test_estimate_cycle_profit_net_of_fees() {
        let config = sample_config();
        let ladder = build_ladder(&config, 29500.0).unwrap();

        let estimate = estimate_cycle_profit(&config, &ladder).unwrap();
        assert_eq!(estimate.buy_price, 29000.0);
        assert_eq!(estimate.sell_price, 30000.0);
        assert!((estimate.gross_profit - 1.0).abs() < 1e-9);
        // kraken费率0.0016，买卖两腿
        assert!((estimate.fees - 0.0016 * 0.001 * 59000.0).abs() < 1e-9);
        assert!(estimate.net_profit < estimate.gross_profit);
        assert!(estimate.net_profit > 0.0);
    }

    #[test]
    fn test_ladder_deterministic_rebuild() {
        let config = sample_config();
        let first = build_ladder(&config, 29500.0).unwrap();
        let second = build_ladder(&config, 29500.0).unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.levels().iter().zip(second.levels()) {
            assert_eq!(a.index, b.index);
            assert_eq!(a.price, b.price);
            assert_eq!(a.side, b.side);
        }
    }
}
