// 网格引擎 - 阶梯、账本、持仓、风控与会话
pub mod ledger;
pub mod pairs;
pub mod planner;
pub mod position;
pub mod reactor;
pub mod recovery;
pub mod risk;
pub mod session;

pub use ledger::{FillOutcome, OrderLedger};
pub use pairs::select_pair;
pub use planner::{build_ladder, estimate_cycle_profit, quantity_for_level, GridLadder, GridLevel};
pub use position::{PositionSnapshot, PositionTracker};
pub use reactor::{CounterDecision, CounterProposal};
pub use risk::{RiskAction, RiskGuard};
pub use session::{GridSession, SessionReport};
