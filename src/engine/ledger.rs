//! 订单账本模块
//! 会话内所有网格订单的唯一权威记录，单写者持有

use crate::core::error::GridError;
use crate::core::types::{FillEvent, GridOrder, OrderStatus, Result};
use log::warn;
use std::collections::{HashMap, HashSet};

/// 成交应用结果
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// fill_id已处理过，本次为重复推送
    Duplicate,
    /// 交易所订单号在账本中不存在
    Unknown,
    /// 部分成交，订单仍在场
    Partial(GridOrder),
    /// 订单全部成交，转入终态
    Completed(GridOrder),
}

/// 订单账本：订单号 -> 订单，外加档位与交易所订单号两个索引
/// 不变式：每个档位至多一笔非终态订单
#[derive(Debug, Default)]
pub struct OrderLedger {
    orders: HashMap<String, GridOrder>,
    /// 档位 -> 当前非终态订单号
    active_by_level: HashMap<usize, String>,
    /// 交易所订单号 -> 本地订单号
    by_exchange_id: HashMap<String, String>,
    /// 已应用过的成交号，至少一次送达下的去重依据
    seen_fill_ids: HashSet<String>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新订单（Pending），档位被占用时拒绝
    pub fn register(&mut self, order: GridOrder) -> Result<()> {
        if let Some(existing_id) = self.active_by_level.get(&order.level_index) {
            return Err(GridError::OrderError(format!(
                "档位{}已有在场订单{}，拒绝登记{}",
                order.level_index, existing_id, order.id
            )));
        }
        if self.orders.contains_key(&order.id) {
            return Err(GridError::OrderError(format!("订单号重复: {}", order.id)));
        }

        if !order.is_terminal() {
            self.active_by_level
                .insert(order.level_index, order.id.clone());
        }
        if let Some(ex_id) = &order.exchange_order_id {
            self.by_exchange_id.insert(ex_id.clone(), order.id.clone());
        }
        self.orders.insert(order.id.clone(), order);
        Ok(())
    }

    /// 网关确认受理后 Pending -> Open，并绑定交易所订单号
    pub fn mark_open(&mut self, order_id: &str, exchange_order_id: String) -> Result<()> {
        let order = self.get_mut(order_id)?;
        if order.status != OrderStatus::Pending {
            return Err(GridError::OrderError(format!(
                "订单{}状态{:?}不允许转为Open",
                order_id, order.status
            )));
        }
        order.status = OrderStatus::Open;
        order.exchange_order_id = Some(exchange_order_id.clone());
        order.updated_at = chrono::Utc::now();
        self.by_exchange_id
            .insert(exchange_order_id, order_id.to_string());
        Ok(())
    }

    /// 下单被拒或重试耗尽，Pending -> Rejected，释放档位
    pub fn mark_rejected(&mut self, order_id: &str) -> Result<GridOrder> {
        let order = self.get_mut(order_id)?;
        if order.status != OrderStatus::Pending {
            return Err(GridError::OrderError(format!(
                "订单{}状态{:?}不允许转为Rejected",
                order_id, order.status
            )));
        }
        order.status = OrderStatus::Rejected;
        order.updated_at = chrono::Utc::now();
        let snapshot = order.clone();
        self.release_level(&snapshot);
        Ok(snapshot)
    }

    /// 撤单成功，非终态 -> Cancelled，释放档位
    pub fn mark_cancelled(&mut self, order_id: &str) -> Result<GridOrder> {
        let order = self.get_mut(order_id)?;
        if order.is_terminal() {
            return Err(GridError::OrderError(format!(
                "订单{}已处于终态{:?}，不允许再撤销",
                order_id, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        order.updated_at = chrono::Utc::now();
        let snapshot = order.clone();
        self.release_level(&snapshot);
        Ok(snapshot)
    }

    /// 应用一笔成交：按fill_id去重，累计数量，必要时转入终态
    /// 数量朝订单总量收口，避免交易所侧舍入导致的超额
    pub fn apply_fill(&mut self, fill: &FillEvent) -> FillOutcome {
        if self.seen_fill_ids.contains(&fill.fill_id) {
            return FillOutcome::Duplicate;
        }

        let order_id = match self.by_exchange_id.get(&fill.exchange_order_id) {
            Some(id) => id.clone(),
            None => return FillOutcome::Unknown,
        };
        self.seen_fill_ids.insert(fill.fill_id.clone());

        let order = match self.orders.get_mut(&order_id) {
            Some(o) => o,
            None => return FillOutcome::Unknown,
        };

        if order.is_terminal() {
            warn!(
                "⚠️ 订单{}已终态{:?}，忽略迟到成交{}",
                order_id, order.status, fill.fill_id
            );
            return FillOutcome::Duplicate;
        }

        order.filled_quantity = (order.filled_quantity + fill.quantity).min(order.quantity);
        order.updated_at = fill.timestamp;

        if order.remaining() <= order.quantity * 1e-9 {
            order.filled_quantity = order.quantity;
            order.status = OrderStatus::Filled;
            let snapshot = order.clone();
            self.release_level(&snapshot);
            FillOutcome::Completed(snapshot)
        } else {
            order.status = OrderStatus::PartiallyFilled;
            FillOutcome::Partial(order.clone())
        }
    }

    pub fn get(&self, order_id: &str) -> Option<&GridOrder> {
        self.orders.get(order_id)
    }

    pub fn find_by_exchange_id(&self, exchange_order_id: &str) -> Option<&GridOrder> {
        self.by_exchange_id
            .get(exchange_order_id)
            .and_then(|id| self.orders.get(id))
    }

    /// 档位上的在场订单
    pub fn active_at_level(&self, level_index: usize) -> Option<&GridOrder> {
        self.active_by_level
            .get(&level_index)
            .and_then(|id| self.orders.get(id))
    }

    pub fn is_level_free(&self, level_index: usize) -> bool {
        !self.active_by_level.contains_key(&level_index)
    }

    /// 所有非终态订单
    pub fn active_orders(&self) -> Vec<&GridOrder> {
        let mut orders: Vec<&GridOrder> = self
            .active_by_level
            .values()
            .filter_map(|id| self.orders.get(id))
            .collect();
        orders.sort_by_key(|o| o.level_index);
        orders
    }

    pub fn active_count(&self) -> usize {
        self.active_by_level.len()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn orders(&self) -> impl Iterator<Item = &GridOrder> {
        self.orders.values()
    }

    fn get_mut(&mut self, order_id: &str) -> Result<&mut GridOrder> {
        self.orders
            .get_mut(order_id)
            .ok_or_else(|| GridError::OrderError(format!("账本中不存在订单: {}", order_id)))
    }

    fn release_level(&mut self, order: &GridOrder) {
        if self
            .active_by_level
            .get(&order.level_index)
            .map(|id| id == &order.id)
            .unwrap_or(false)
        {
            self.active_by_level.remove(&order.level_index);
        }
    }
}
