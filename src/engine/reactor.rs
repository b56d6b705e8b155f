//! 成交反应器模块
//! 一笔成交的全部状态变更在持锁期间一次完成：账本流转、持仓结算、对手单决策

use crate::core::types::{FillEvent, GridOrder, OrderSide};
use crate::engine::ledger::{FillOutcome, OrderLedger};
use crate::engine::planner::GridLadder;
use crate::engine::position::PositionTracker;
use log::{info, warn};

/// 对手单提案：成交档位向参考方向移动一档
#[derive(Debug, Clone, PartialEq)]
pub struct CounterProposal {
    pub level_index: usize,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
}

/// 对手单决策结果
#[derive(Debug, Clone, PartialEq)]
pub enum CounterDecision {
    /// 提案成立，待风控与网关受理
    Proposed(CounterProposal),
    /// 成交发生在阶梯边缘，没有再进一档的位置
    EdgeOfLadder { level_index: usize },
    /// 目标档位已有在场订单，跳过本次补挂
    LevelOccupied { level_index: usize },
    /// 部分成交，等待全部成交后再补挂
    AwaitingFull,
    /// 重复成交推送，未做任何变更
    Duplicate,
    /// 交易所订单号不在账本中，交由对账流程处理
    Unknown,
}

/// 成交应用结果
#[derive(Debug)]
pub struct FillApplication {
    /// 本笔计入的手续费（重复/未知成交为0）
    pub fee: f64,
    /// 全部成交时的订单终态快照
    pub completed_order: Option<GridOrder>,
    pub decision: CounterDecision,
}

/// 应用一笔成交事件
/// 调用方必须持有会话状态锁，保证账本与持仓的变更对外原子可见
pub fn apply_fill(
    ladder: &GridLadder,
    ledger: &mut OrderLedger,
    position: &mut PositionTracker,
    fill: &FillEvent,
    fee_rate: f64,
) -> FillApplication {
    match ledger.apply_fill(fill) {
        FillOutcome::Duplicate => FillApplication {
            fee: 0.0,
            completed_order: None,
            decision: CounterDecision::Duplicate,
        },
        FillOutcome::Unknown => FillApplication {
            fee: 0.0,
            completed_order: None,
            decision: CounterDecision::Unknown,
        },
        FillOutcome::Partial(order) => {
            let fee = position.apply_fill(fill, fee_rate);
            info!(
                "📊 订单{}部分成交 {}/{} @ {}",
                order.id, order.filled_quantity, order.quantity, fill.price
            );
            FillApplication {
                fee,
                completed_order: None,
                decision: CounterDecision::AwaitingFull,
            }
        }
        FillOutcome::Completed(order) => {
            let fee = position.apply_fill(fill, fee_rate);
            info!(
                "✅ 订单{}全部成交: {} {} @ {}",
                order.id, order.side, order.quantity, order.price
            );
            let decision = decide_counter(ladder, ledger, &order);
            FillApplication {
                fee,
                completed_order: Some(order),
                decision,
            }
        }
    }
}

/// 全部成交后的对手单决策：买单向上一档挂卖，卖单向下一档挂买
fn decide_counter(
    ladder: &GridLadder,
    ledger: &OrderLedger,
    filled: &GridOrder,
) -> CounterDecision {
    let counter_index = match ladder.counter_index(filled.level_index, filled.side) {
        Some(index) => index,
        None => {
            warn!(
                "⚠️ 档位{}({})成交于阶梯边缘，跳过对手单",
                filled.level_index, filled.side
            );
            return CounterDecision::EdgeOfLadder {
                level_index: filled.level_index,
            };
        }
    };

    let level = match ladder.level(counter_index) {
        Some(level) => level,
        None => {
            return CounterDecision::EdgeOfLadder {
                level_index: filled.level_index,
            }
        }
    };

    if !ledger.is_level_free(counter_index) {
        warn!("⚠️ 对手档位{}已被占用，跳过本次补挂", counter_index);
        return CounterDecision::LevelOccupied {
            level_index: counter_index,
        };
    }

    CounterDecision::Proposed(CounterProposal {
        level_index: counter_index,
        side: filled.side.opposite(),
        price: level.price,
        quantity: filled.quantity,
    })
}
