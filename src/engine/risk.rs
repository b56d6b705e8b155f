//! 风控模块
//! 下单前检查、持续检查与网关熔断，全部在会话状态锁内调用

use crate::core::config::GridConfig;
use crate::core::error::GridError;
use crate::core::types::{OrderSide, Result, SessionStatus};
use crate::engine::position::PositionTracker;
use chrono::{DateTime, Duration, Utc};
use log::{error, warn};
use std::collections::VecDeque;

/// 持续检查触发的处置动作
#[derive(Debug, Clone, PartialEq)]
pub enum RiskAction {
    /// 撤掉全部挂单并暂停会话
    KillSwitch(String),
    /// 暂停会话，挂单是否撤销由配置决定
    Pause(String),
}

/// 会话级风控
pub struct RiskGuard {
    lower_bound: f64,
    upper_bound: f64,
    max_position: f64,
    max_daily_loss: f64,
    out_of_range_tolerance_pct: f64,
    max_consecutive_failures: u32,
    failure_window: Duration,
    /// 连续网关失败的时间戳，成功即清空
    failure_streak: VecDeque<DateTime<Utc>>,
}

impl RiskGuard {
    pub fn new(config: &GridConfig) -> Self {
        Self {
            lower_bound: config.grid.lower_bound,
            upper_bound: config.grid.upper_bound,
            max_position: config.risk.max_position,
            max_daily_loss: config.risk.max_daily_loss,
            out_of_range_tolerance_pct: config.risk.out_of_range_tolerance_pct,
            max_consecutive_failures: config.risk.max_consecutive_gateway_failures,
            failure_window: Duration::seconds(config.risk.failure_window_secs as i64),
            failure_streak: VecDeque::new(),
        }
    }

    /// 下单前检查：会话状态、价格区间、敞口上限
    /// 任何一项不过即拒绝该笔订单，不影响会话本身
    pub fn pre_trade_check(
        &self,
        status: SessionStatus,
        side: OrderSide,
        price: f64,
        quantity: f64,
        position: &PositionTracker,
    ) -> Result<()> {
        if status != SessionStatus::Active {
            return Err(GridError::RiskViolation(format!(
                "会话状态{:?}不接受新订单",
                status
            )));
        }

        if price < self.lower_bound || price > self.upper_bound {
            return Err(GridError::RiskViolation(format!(
                "订单价格{}超出网格区间[{}, {}]",
                price, self.lower_bound, self.upper_bound
            )));
        }

        let signed_qty = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        let projected = position.inventory() + signed_qty;
        let projected_notional = projected.abs() * price;
        let current_notional = position.notional_exposure(price);
        // 只拦截扩大敞口的订单，减仓方向始终放行
        if projected_notional > self.max_position && projected_notional > current_notional {
            return Err(GridError::RiskViolation(format!(
                "敞口超限: 预计{:.2}超过上限{:.2}",
                projected_notional, self.max_position
            )));
        }

        Ok(())
    }

    /// 每个轮询周期执行的持续检查
    pub fn continuous_check(&self, last_price: f64, daily_pnl: f64) -> Option<RiskAction> {
        if daily_pnl <= -self.max_daily_loss {
            error!("❌ 触发日亏损限制: {:.2}", daily_pnl);
            return Some(RiskAction::KillSwitch(format!(
                "日亏损{:.2}达到上限{:.2}",
                -daily_pnl, self.max_daily_loss
            )));
        }

        let tolerance = (self.upper_bound - self.lower_bound) * self.out_of_range_tolerance_pct
            / 100.0;
        if last_price < self.lower_bound - tolerance || last_price > self.upper_bound + tolerance {
            warn!(
                "⚠️ 价格{}越出网格区间[{}, {}]，容忍度{:.2}",
                last_price, self.lower_bound, self.upper_bound, tolerance
            );
            return Some(RiskAction::Pause(format!(
                "价格{}越出网格区间[{}, {}]",
                last_price, self.lower_bound, self.upper_bound
            )));
        }

        None
    }

    /// 记录一次网关调用失败，窗口内连续失败达到阈值即熔断
    pub fn record_gateway_failure(&mut self, now: DateTime<Utc>) -> Option<RiskAction> {
        self.failure_streak.push_back(now);
        while let Some(first) = self.failure_streak.front() {
            if now.signed_duration_since(*first) > self.failure_window {
                self.failure_streak.pop_front();
            } else {
                break;
            }
        }

        if self.failure_streak.len() >= self.max_consecutive_failures as usize {
            error!(
                "🚨 {}秒内连续{}次网关调用失败，触发熔断",
                self.failure_window.num_seconds(),
                self.failure_streak.len()
            );
            self.failure_streak.clear();
            return Some(RiskAction::Pause(format!(
                "连续{}次网关调用失败，疑似交易所异常",
                self.max_consecutive_failures
            )));
        }
        None
    }

    /// 网关调用成功，清空失败计数
    pub fn record_gateway_success(&mut self) {
        self.failure_streak.clear();
    }

    pub fn consecutive_failures(&self) -> usize {
        self.failure_streak.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        CampaignConfig, ExecutionParams, GridParams, JournalParams, OrderSizeConfig,
        OrderSizeMode, PairSelectionConfig, RiskParams,
    };
    use crate::core::types::{FillEvent, SpacingMode};
    use chrono::TimeZone;

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
                out_of_range_tolerance_pct: 5.0,
                max_consecutive_gateway_failures: 3,
                failure_window_secs: 60,
                cancel_on_pause: false,
                cancel_on_stop: true,
            },
            execution: ExecutionParams::default(),
            journal: JournalParams::default(),
            persistence: None,
        }
    }

    fn long_position(quantity: f64, price: f64) -> PositionTracker {
        let mut tracker = PositionTracker::new("BTC/USD".to_string());
        tracker.apply_fill(
            &FillEvent {
                fill_id: "seed".to_string(),
                exchange_order_id: "ex-seed".to_string(),
                pair: "BTC/USD".to_string(),
                side: OrderSide::Buy,
                price,
                quantity,
                fee: Some(0.0),
                timestamp: Utc::now(),
            },
            0.0,
        );
        tracker
    }

    #[test]
    fn test_pre_trade_rejects_when_not_active() {
        let guard = RiskGuard::new(&sample_config());
        let position = PositionTracker::new("BTC/USD".to_string());

        let err = guard
            .pre_trade_check(
                SessionStatus::Paused,
                OrderSide::Buy,
                29000.0,
                0.001,
                &position,
            )
            .unwrap_err();
        assert!(matches!(err, GridError::RiskViolation(_)));
    }

    #[test]
    fn test_pre_trade_rejects_price_outside_bounds() {
        let guard = RiskGuard::new(&sample_config());
        let position = PositionTracker::new("BTC/USD".to_string());

        assert!(guard
            .pre_trade_check(
                SessionStatus::Active,
                OrderSide::Buy,
                24000.0,
                0.001,
                &position
            )
            .is_err());
        assert!(guard
            .pre_trade_check(
                SessionStatus::Active,
                OrderSide::Sell,
                36000.0,
                0.001,
                &position
            )
            .is_err());
    }

    #[test]
    fn test_pre_trade_rejects_exposure_breach() {
        let guard = RiskGuard::new(&sample_config());
        // 已持仓0.015 BTC @ 29000 ≈ 435名义
        let position = long_position(0.015, 29000.0);

        // 再买0.01会把敞口推到725，超过500上限
        let err = guard
            .pre_trade_check(
                SessionStatus::Active,
                OrderSide::Buy,
                29000.0,
                0.01,
                &position,
            )
            .unwrap_err();
        assert!(matches!(err, GridError::RiskViolation(_)));
    }

    #[test]
    fn test_pre_trade_allows_reducing_sell_over_cap() {
        let guard = RiskGuard::new(&sample_config());
        // 敞口已超上限
        let position = long_position(0.03, 29000.0);
        assert!(position.notional_exposure(29000.0) > 500.0);

        assert!(guard
            .pre_trade_check(
                SessionStatus::Active,
                OrderSide::Sell,
                30000.0,
                0.001,
                &position
            )
            .is_ok());
    }

    #[test]
    fn test_continuous_kill_switch_on_daily_loss() {
        let guard = RiskGuard::new(&sample_config());

        let action = guard.continuous_check(29000.0, -150.0);
        assert!(matches!(action, Some(RiskAction::KillSwitch(_))));

        assert_eq!(guard.continuous_check(29000.0, -149.0), None);
    }

    #[test]
    fn test_continuous_pause_when_price_exits_range() {
        let guard = RiskGuard::new(&sample_config());

        // 容忍度5%宽度=500
        assert_eq!(guard.continuous_check(35400.0, 0.0), None);
        assert!(matches!(
            guard.continuous_check(35600.0, 0.0),
            Some(RiskAction::Pause(_))
        ));
        assert!(matches!(
            guard.continuous_check(24400.0, 0.0),
            Some(RiskAction::Pause(_))
        ));
    }

    #[test]
    fn test_breaker_trips_after_consecutive_failures() {
        let mut guard = RiskGuard::new(&sample_config());
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        assert_eq!(guard.record_gateway_failure(base), None);
        assert_eq!(
            guard.record_gateway_failure(base + Duration::seconds(5)),
            None
        );
        let action = guard.record_gateway_failure(base + Duration::seconds(10));
        assert!(matches!(action, Some(RiskAction::Pause(_))));
        // 熔断后计数清零
        assert_eq!(guard.consecutive_failures(), 0);
    }

    #[test]
    fn test_breaker_success_resets_streak() {
        let mut guard = RiskGuard::new(&sample_config());
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        guard.record_gateway_failure(base);
        guard.record_gateway_failure(base + Duration::seconds(5));
        guard.record_gateway_success();
        assert_eq!(guard.consecutive_failures(), 0);

        assert_eq!(
            guard.record_gateway_failure(base + Duration::seconds(10)),
            None
        );
    }

    #[test]
    fn test_breaker_ignores_failures_outside_window() {
        let mut guard = RiskGuard::new(&sample_config());
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        guard.record_gateway_failure(base);
        guard.record_gateway_failure(base + Duration::seconds(30));
        // 第三次与第一次间隔超过窗口，前面的失败被移出
        let action = guard.record_gateway_failure(base + Duration::seconds(90));
        assert_eq!(action, None);
        assert_eq!(guard.consecutive_failures(), 2);
    }
}
