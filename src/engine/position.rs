//! 持仓与盈亏模块
//! 跟踪基础资产净持仓、加权开仓均价、已实现与未实现盈亏、手续费

use crate::core::types::{FillEvent, OrderSide, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

const INVENTORY_EPS: f64 = 1e-12;

/// 成交明细记录，导出CSV用
#[derive(Debug, Clone, Serialize)]
pub struct FillRecord {
    pub fill_id: String,
    pub order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

/// 对外快照（事件日志与远端镜像共用）
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub pair: String,
    pub inventory: f64,
    pub avg_entry_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub fees_paid: f64,
    pub daily_pnl: f64,
    pub buy_fill_count: u64,
    pub sell_fill_count: u64,
}

/// 持仓跟踪器：带符号净持仓 + 加权均价
/// 同向成交摊薄均价，反向成交先平仓结算已实现盈亏，穿仓则按成交价重开
#[derive(Debug)]
pub struct PositionTracker {
    pair: String,
    inventory: f64,
    avg_entry_price: f64,
    realized_pnl: f64,
    fees_paid: f64,
    /// 当日已实现盈亏，UTC日期切换时清零
    realized_today: f64,
    fees_today: f64,
    current_day: Option<NaiveDate>,
    buy_fill_count: u64,
    sell_fill_count: u64,
    fills: Vec<FillRecord>,
}

impl PositionTracker {
    pub fn new(pair: String) -> Self {
        Self {
            pair,
            inventory: 0.0,
            avg_entry_price: 0.0,
            realized_pnl: 0.0,
            fees_paid: 0.0,
            realized_today: 0.0,
            fees_today: 0.0,
            current_day: None,
            buy_fill_count: 0,
            sell_fill_count: 0,
            fills: Vec::new(),
        }
    }

    /// 应用一笔成交，返回本笔计入的手续费
    /// 交易所未报费用时按费率估算
    pub fn apply_fill(&mut self, fill: &FillEvent, default_fee_rate: f64) -> f64 {
        self.roll_day_if_needed(fill.timestamp);

        let fee = fill.fee.unwrap_or_else(|| fill.cost() * default_fee_rate);
        self.fees_paid += fee;
        self.fees_today += fee;

        let signed_qty = match fill.side {
            OrderSide::Buy => fill.quantity,
            OrderSide::Sell => -fill.quantity,
        };

        if self.inventory.abs() < INVENTORY_EPS || self.inventory.signum() == signed_qty.signum() {
            // 开仓或同向加仓，摊薄均价
            let old_abs = self.inventory.abs();
            let total = old_abs + fill.quantity;
            self.avg_entry_price =
                (self.avg_entry_price * old_abs + fill.price * fill.quantity) / total;
            self.inventory += signed_qty;
        } else {
            // 反向成交，先结算可平部分
            let closing = fill.quantity.min(self.inventory.abs());
            let direction = self.inventory.signum();
            let realized = (fill.price - self.avg_entry_price) * closing * direction;
            self.realized_pnl += realized;
            self.realized_today += realized;

            self.inventory += signed_qty;
            if self.inventory.abs() < INVENTORY_EPS {
                self.inventory = 0.0;
                self.avg_entry_price = 0.0;
            } else if self.inventory.signum() != direction {
                // 穿仓，剩余部分按本笔成交价重新开仓
                self.avg_entry_price = fill.price;
            }
        }

        match fill.side {
            OrderSide::Buy => self.buy_fill_count += 1,
            OrderSide::Sell => self.sell_fill_count += 1,
        }

        self.fills.push(FillRecord {
            fill_id: fill.fill_id.clone(),
            order_id: fill.exchange_order_id.clone(),
            pair: fill.pair.clone(),
            side: fill.side,
            price: fill.price,
            quantity: fill.quantity,
            fee,
            timestamp: fill.timestamp,
        });

        fee
    }

    pub fn inventory(&self) -> f64 {
        self.inventory
    }

    pub fn avg_entry_price(&self) -> f64 {
        self.avg_entry_price
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn fees_paid(&self) -> f64 {
        self.fees_paid
    }

    pub fn fill_count(&self) -> u64 {
        self.buy_fill_count + self.sell_fill_count
    }

    /// 按当前价计算的未实现盈亏
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        if self.inventory.abs() < INVENTORY_EPS {
            return 0.0;
        }
        (current_price - self.avg_entry_price) * self.inventory
    }

    /// 当日盈亏 = 当日已实现 - 当日手续费 + 当前未实现
    /// 风控的日亏损上限以此为准
    pub fn daily_pnl(&mut self, current_price: f64, now: DateTime<Utc>) -> f64 {
        self.roll_day_if_needed(now);
        self.realized_today - self.fees_today + self.unrealized_pnl(current_price)
    }

    /// 名义敞口（计价货币），风控的持仓上限以此为准
    pub fn notional_exposure(&self, current_price: f64) -> f64 {
        self.inventory.abs() * current_price
    }

    pub fn snapshot(&self, current_price: f64) -> PositionSnapshot {
        PositionSnapshot {
            pair: self.pair.clone(),
            inventory: self.inventory,
            avg_entry_price: self.avg_entry_price,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl(current_price),
            fees_paid: self.fees_paid,
            daily_pnl: self.realized_today - self.fees_today + self.unrealized_pnl(current_price),
            buy_fill_count: self.buy_fill_count,
            sell_fill_count: self.sell_fill_count,
        }
    }

    pub fn fills(&self) -> &[FillRecord] {
        &self.fills
    }

    /// 导出全部成交明细到CSV
    pub fn export_fills_csv(&self, path: &Path) -> Result<()> {
        let mut file = fs::File::create(path)?;
        writeln!(file, "fill_id,order_id,pair,side,price,quantity,fee,timestamp")?;
        for record in &self.fills {
            writeln!(
                file,
                "{},{},{},{},{},{},{},{}",
                record.fill_id,
                record.order_id,
                record.pair,
                record.side.to_string().to_lowercase(),
                record.price,
                record.quantity,
                record.fee,
                record.timestamp.to_rfc3339()
            )?;
        }
        Ok(())
    }

    fn roll_day_if_needed(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        match self.current_day {
            Some(day) if day == today => {}
            _ => {
                self.current_day = Some(today);
                self.realized_today = 0.0;
                self.fees_today = 0.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_fill(
        fill_id: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
        fee: Option<f64>,
    ) -> FillEvent {
        FillEvent {
            fill_id: fill_id.to_string(),
            exchange_order_id: format!("ex-{}", fill_id),
            pair: "BTC/USD".to_string(),
            side,
            price,
            quantity,
            fee,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_buy_then_sell_realizes_spread() {
        let mut tracker = PositionTracker::new("BTC/USD".to_string());
        tracker.apply_fill(
            &sample_fill("f1", OrderSide::Buy, 29000.0, 0.001, Some(0.0)),
            0.0,
        );
        tracker.apply_fill(
            &sample_fill("f2", OrderSide::Sell, 30000.0, 0.001, Some(0.0)),
            0.0,
        );

        assert!((tracker.realized_pnl() - 1.0).abs() < 1e-9);
        assert_eq!(tracker.inventory(), 0.0);
        assert_eq!(tracker.avg_entry_price(), 0.0);
    }

    #[test]
    fn test_weighted_average_entry() {
        let mut tracker = PositionTracker::new("BTC/USD".to_string());
        tracker.apply_fill(
            &sample_fill("f1", OrderSide::Buy, 28000.0, 0.001, Some(0.0)),
            0.0,
        );
        tracker.apply_fill(
            &sample_fill("f2", OrderSide::Buy, 29000.0, 0.003, Some(0.0)),
            0.0,
        );

        assert!((tracker.inventory() - 0.004).abs() < 1e-12);
        assert!((tracker.avg_entry_price() - 28750.0).abs() < 1e-9);
    }

    #[test]
    fn test_unrealized_pnl_on_long() {
        let mut tracker = PositionTracker::new("BTC/USD".to_string());
        tracker.apply_fill(
            &sample_fill("f1", OrderSide::Buy, 29000.0, 0.002, Some(0.0)),
            0.0,
        );

        assert!((tracker.unrealized_pnl(30000.0) - 2.0).abs() < 1e-9);
        assert!((tracker.unrealized_pnl(28000.0) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_fee_estimated_from_rate_when_missing() {
        let mut tracker = PositionTracker::new("BTC/USD".to_string());
        let fee = tracker.apply_fill(
            &sample_fill("f1", OrderSide::Buy, 29000.0, 0.001, None),
            0.0016,
        );

        assert!((fee - 29.0 * 0.0016).abs() < 1e-9);
        assert!((tracker.fees_paid() - fee).abs() < 1e-12);
    }

    #[test]
    fn test_exchange_reported_fee_wins() {
        let mut tracker = PositionTracker::new("BTC/USD".to_string());
        let fee = tracker.apply_fill(
            &sample_fill("f1", OrderSide::Buy, 29000.0, 0.001, Some(0.02)),
            0.0016,
        );
        assert_eq!(fee, 0.02);
    }

    #[test]
    fn test_daily_pnl_resets_on_new_day() {
        let mut tracker = PositionTracker::new("BTC/USD".to_string());
        tracker.apply_fill(
            &sample_fill("f1", OrderSide::Buy, 29000.0, 0.001, Some(0.0)),
            0.0,
        );
        tracker.apply_fill(
            &sample_fill("f2", OrderSide::Sell, 30000.0, 0.001, Some(0.0)),
            0.0,
        );

        let same_day = Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap();
        assert!((tracker.daily_pnl(30000.0, same_day) - 1.0).abs() < 1e-9);

        let next_day = Utc.with_ymd_and_hms(2024, 3, 2, 0, 5, 0).unwrap();
        assert_eq!(tracker.daily_pnl(30000.0, next_day), 0.0);
        // 累计已实现不随日切清零
        assert!((tracker.realized_pnl() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_notional_exposure() {
        let mut tracker = PositionTracker::new("BTC/USD".to_string());
        tracker.apply_fill(
            &sample_fill("f1", OrderSide::Buy, 29000.0, 0.01, Some(0.0)),
            0.0,
        );
        assert!((tracker.notional_exposure(30000.0) - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_export_fills_csv() {
        let mut tracker = PositionTracker::new("BTC/USD".to_string());
        tracker.apply_fill(
            &sample_fill("f1", OrderSide::Buy, 29000.0, 0.001, Some(0.05)),
            0.0,
        );
        tracker.apply_fill(
            &sample_fill("f2", OrderSide::Sell, 30000.0, 0.001, Some(0.05)),
            0.0,
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fills_test.csv");
        tracker.export_fills_csv(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "fill_id,order_id,pair,side,price,quantity,fee,timestamp"
        );
        assert!(lines[1].starts_with("f1,ex-f1,BTC/USD,buy,29000,0.001,0.05,"));
        assert!(lines[2].starts_with("f2,ex-f2,BTC/USD,sell,30000,0.001,0.05,"));
    }
}
