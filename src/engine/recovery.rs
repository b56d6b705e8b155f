//! 会话恢复模块
//! 先重放本地事件日志重建账本与持仓（不联网），再补追停机期间的成交，
//! 最后以交易所挂单列表为事实来源对账

use crate::core::error::GridError;
use crate::core::gateway::ExchangeGateway;
use crate::core::types::{GridOrder, OrderStatus, Result};
use crate::engine::ledger::{FillOutcome, OrderLedger};
use crate::engine::planner::{build_ladder, GridLadder};
use crate::engine::position::PositionTracker;
use crate::engine::reactor::{self, CounterDecision, CounterProposal};
use crate::journal::{
    ErrorPayload, Event, EventJournal, EventKind, OrderCancelledPayload, OrderFilledPayload,
    OrderPlacedPayload, SetupPayload,
};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::collections::HashSet;

/// 重放完成后的内存状态
pub struct ReplayedState {
    pub session_id: String,
    pub pair: String,
    pub exchange: String,
    pub reference_price: f64,
    /// 按setup事件里的配置重建的阶梯，与崩溃前完全一致
    pub setup_config: crate::core::config::GridConfig,
    pub ladder: GridLadder,
    pub ledger: OrderLedger,
    pub position: PositionTracker,
    pub last_seq: u64,
    pub last_fill_time: Option<DateTime<Utc>>,
}

/// 对账结果统计
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// 停机期间发生、本次补追入账的成交数
    pub caught_up_fills: u32,
    /// 交易所有、账本无，被收养的订单数
    pub adopted: u32,
    /// 账本有、交易所无，转为外部撤销的订单数
    pub externally_cancelled: u32,
    /// 补追成交产生、待会话激活后下达的对手单
    pub pending_counters: Vec<CounterProposal>,
}

/// 按seq顺序重放事件，重建账本与持仓
/// 首事件必须是setup，否则该日志无法恢复
pub fn replay_events(events: &[Event]) -> Result<ReplayedState> {
    let setup: SetupPayload = match events.first() {
        Some(event) if event.kind == EventKind::Setup => {
            serde_json::from_value(event.payload.clone())?
        }
        _ => {
            return Err(GridError::JournalError(
                "日志首事件不是setup，无法恢复会话".to_string(),
            ))
        }
    };

    let ladder = build_ladder(&setup.config, setup.reference_price)?;
    let mut ledger = OrderLedger::new();
    let mut position = PositionTracker::new(setup.pair.clone());
    let mut last_fill_time: Option<DateTime<Utc>> = None;

    for event in &events[1..] {
        match event.kind {
            EventKind::Setup => {
                warn!("⚠️ 日志中出现重复setup事件 seq={}，已忽略", event.seq);
            }
            EventKind::OrderPlaced => {
                let payload: OrderPlacedPayload = serde_json::from_value(event.payload.clone())?;
                if let Err(e) = ledger.register(payload.order) {
                    warn!("⚠️ 重放order_placed seq={} 失败: {}", event.seq, e);
                }
            }
            EventKind::OrderFilled => {
                let payload: OrderFilledPayload = serde_json::from_value(event.payload.clone())?;
                let mut fill = payload.fill;
                // 采用记录的实际手续费，重放结果与崩溃前逐分一致
                fill.fee = Some(payload.fee);
                match ledger.apply_fill(&fill) {
                    FillOutcome::Partial(_) | FillOutcome::Completed(_) => {
                        position.apply_fill(&fill, 0.0);
                        last_fill_time = Some(match last_fill_time {
                            Some(prev) if prev > fill.timestamp => prev,
                            _ => fill.timestamp,
                        });
                    }
                    FillOutcome::Duplicate => {
                        warn!("⚠️ 重放遇到重复成交 seq={} fill={}", event.seq, fill.fill_id);
                    }
                    FillOutcome::Unknown => {
                        warn!(
                            "⚠️ 重放order_filled seq={} 找不到订单 {}",
                            event.seq, fill.exchange_order_id
                        );
                    }
                }
            }
            EventKind::OrderCancelled => {
                let payload: OrderCancelledPayload =
                    serde_json::from_value(event.payload.clone())?;
                if let Err(e) = ledger.mark_cancelled(&payload.order_id) {
                    warn!("⚠️ 重放order_cancelled seq={} 失败: {}", event.seq, e);
                }
            }
            EventKind::PositionUpdate | EventKind::Error => {}
        }
    }

    let last_seq = events.last().map(|event| event.seq).unwrap_or(0);
    info!(
        "🔄 日志重放完成: {}条事件, 在场订单{}个, 持仓{:.8}",
        events.len(),
        ledger.active_count(),
        position.inventory()
    );

    Ok(ReplayedState {
        session_id: setup.session_id,
        pair: setup.pair,
        exchange: setup.exchange,
        reference_price: setup.reference_price,
        setup_config: setup.config,
        ladder,
        ledger,
        position,
        last_seq,
        last_fill_time,
    })
}

/// 补追停机期间的成交并与交易所挂单对账
/// 必须在会话恢复正常成交处理之前完成
pub async fn catch_up_and_reconcile(
    gateway: &dyn ExchangeGateway,
    journal: &mut EventJournal,
    ladder: &GridLadder,
    ledger: &mut OrderLedger,
    position: &mut PositionTracker,
    pair: &str,
    since: DateTime<Utc>,
    fee_rate: f64,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    // 1. 先补成交：停机期间全部成交的订单不在挂单列表里，
    //    不先入账会被误判为外部撤销，持仓就丢了
    let fills = gateway.poll_fills(pair, since).await?;
    for fill in &fills {
        let order_id = ledger
            .find_by_exchange_id(&fill.exchange_order_id)
            .map(|order| order.id.clone());
        let application = reactor::apply_fill(ladder, ledger, position, fill, fee_rate);

        match &application.decision {
            CounterDecision::Duplicate => continue,
            CounterDecision::Unknown => {
                let message = format!(
                    "停机期间成交{}无法匹配账本订单{}",
                    fill.fill_id, fill.exchange_order_id
                );
                warn!("⚠️ {}", GridError::ReconciliationMismatch(message.clone()));
                journal.append(
                    EventKind::Error,
                    serde_json::to_value(ErrorPayload {
                        message,
                        context: Some("reconciliation".to_string()),
                    })?,
                )?;
                continue;
            }
            _ => {}
        }

        report.caught_up_fills += 1;
        journal.append(
            EventKind::OrderFilled,
            serde_json::to_value(OrderFilledPayload {
                order_id: order_id.unwrap_or_default(),
                fill: fill.clone(),
                fee: application.fee,
                completed: application.completed_order.is_some(),
            })?,
        )?;
        if let CounterDecision::Proposed(proposal) = application.decision {
            report.pending_counters.push(proposal);
        }
    }

    // 2. 对账：交易所挂单列表是事实来源
    let open_orders = gateway.list_open_orders(pair).await?;
    let exchange_ids: HashSet<&str> = open_orders
        .iter()
        .map(|order| order.exchange_order_id.as_str())
        .collect();

    // 账本有、交易所无 -> 外部撤销
    let stale: Vec<String> = ledger
        .active_orders()
        .iter()
        .filter(|order| {
            matches!(
                order.status,
                OrderStatus::Open | OrderStatus::PartiallyFilled
            )
        })
        .filter(|order| {
            order
                .exchange_order_id
                .as_deref()
                .map(|id| !exchange_ids.contains(id))
                .unwrap_or(true)
        })
        .map(|order| order.id.clone())
        .collect();

    for order_id in stale {
        match ledger.mark_cancelled(&order_id) {
            Ok(cancelled) => {
                report.externally_cancelled += 1;
                let message = format!("订单{}在交易所侧已不存在，视为外部撤销", order_id);
                warn!("⚠️ 对账不一致: {}", message);
                journal.append(
                    EventKind::Error,
                    serde_json::to_value(ErrorPayload {
                        message,
                        context: Some("reconciliation".to_string()),
                    })?,
                )?;
                journal.append(
                    EventKind::OrderCancelled,
                    serde_json::to_value(OrderCancelledPayload {
                        order_id: cancelled.id.clone(),
                        exchange_order_id: cancelled.exchange_order_id.clone(),
                        reason: "对账: 交易所侧已不存在".to_string(),
                    })?,
                )?;
            }
            Err(e) => warn!("⚠️ 对账撤销订单{}失败: {}", order_id, e),
        }
    }

    // 交易所有、账本无 -> 按价格挂回最近的空闲档位收养
    for open in &open_orders {
        if ledger.find_by_exchange_id(&open.exchange_order_id).is_some() {
            continue;
        }

        let level_index = match nearest_free_level(ladder, ledger, open.price) {
            Some(index) => index,
            None => {
                let message = format!(
                    "交易所订单{}无空闲档位可收养，需人工处理",
                    open.exchange_order_id
                );
                error!("❌ 对账不一致: {}", message);
                journal.append(
                    EventKind::Error,
                    serde_json::to_value(ErrorPayload {
                        message,
                        context: Some("reconciliation".to_string()),
                    })?,
                )?;
                continue;
            }
        };

        let mut order = GridOrder::new(
            format!("adopted-{}", open.exchange_order_id),
            level_index,
            open.side,
            open.price,
            open.quantity,
        );
        order.filled_quantity = open.filled_quantity;
        order.status = if open.filled_quantity > 0.0 {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Open
        };
        order.exchange_order_id = Some(open.exchange_order_id.clone());

        match ledger.register(order.clone()) {
            Ok(()) => {
                report.adopted += 1;
                let message = format!(
                    "收养交易所订单{}到档位{} ({} {} @ {})",
                    open.exchange_order_id, level_index, open.side, open.quantity, open.price
                );
                warn!("⚠️ 对账不一致: {}", message);
                journal.append(
                    EventKind::Error,
                    serde_json::to_value(ErrorPayload {
                        message,
                        context: Some("reconciliation".to_string()),
                    })?,
                )?;
                journal.append(
                    EventKind::OrderPlaced,
                    serde_json::to_value(OrderPlacedPayload { order })?,
                )?;
            }
            Err(e) => warn!("⚠️ 收养订单{}失败: {}", open.exchange_order_id, e),
        }
    }

    info!(
        "🔄 对账完成: 补追成交{}笔, 收养{}单, 外部撤销{}单",
        report.caught_up_fills, report.adopted, report.externally_cancelled
    );
    Ok(report)
}

/// 距给定价格最近且未被占用的档位
fn nearest_free_level(ladder: &GridLadder, ledger: &OrderLedger, price: f64) -> Option<usize> {
    ladder
        .levels()
        .iter()
        .filter(|level| ledger.is_level_free(level.index))
        .min_by(|a, b| {
            let da = (a.price - price).abs();
            let db = (b.price - price).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|level| level.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        CampaignConfig, ExecutionParams, GridConfig, GridParams, JournalParams, OrderSizeConfig,
        OrderSizeMode, PairSelectionConfig, RiskParams,
    };
    use crate::core::types::{
        Balance, FillEvent, OpenOrder, OrderRequest, OrderSide, SpacingMode, Ticker,
    };
    use async_trait::async_trait;
    use chrono::Utc;

    fn sample_config() -> GridConfig {
        GridConfig {
            campaign: CampaignConfig {
                name: "btc-grid".to_string(),
                exchange: "paper".to_string(),
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

    struct StubGateway {
        open_orders: Vec<OpenOrder>,
        fills: Vec<FillEvent>,
    }

    #[async_trait]
    impl ExchangeGateway for StubGateway {
        fn name(&self) -> &str {
            "stub"
        }

        async fn place_order(&self, _request: &OrderRequest) -> Result<String> {
            Ok("stub-order".to_string())
        }

        async fn cancel_order(&self, _exchange_order_id: &str, _pair: &str) -> Result<()> {
            Ok(())
        }

        async fn list_open_orders(&self, _pair: &str) -> Result<Vec<OpenOrder>> {
            Ok(self.open_orders.clone())
        }

        async fn poll_fills(&self, _pair: &str, _since: DateTime<Utc>) -> Result<Vec<FillEvent>> {
            Ok(self.fills.clone())
        }

        async fn get_ticker(&self, pair: &str) -> Result<Ticker> {
            Ok(Ticker {
                pair: pair.to_string(),
                high: 30000.0,
                low: 29000.0,
                bid: 29400.0,
                ask: 29600.0,
                last: 29500.0,
                volume: 100.0,
                timestamp: Utc::now(),
            })
        }

        async fn get_balances(&self) -> Result<Vec<Balance>> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn setup_event(seq: u64) -> Event {
        Event {
            seq,
            timestamp: Utc::now(),
            kind: EventKind::Setup,
            payload: serde_json::to_value(SetupPayload {
                session_id: "grid-btcusd-1".to_string(),
                pair: "BTC/USD".to_string(),
                exchange: "paper".to_string(),
                reference_price: 29500.0,
                config: sample_config(),
                cycle_estimate: None,
            })
            .unwrap(),
        }
    }

    fn placed_event(seq: u64, order_id: &str, level: usize, side: OrderSide, price: f64) -> Event {
        let mut order = GridOrder::new(order_id.to_string(), level, side, price, 0.001);
        order.status = OrderStatus::Open;
        order.exchange_order_id = Some(format!("ex-{}", order_id));
        Event {
            seq,
            timestamp: Utc::now(),
            kind: EventKind::OrderPlaced,
            payload: serde_json::to_value(OrderPlacedPayload { order }).unwrap(),
        }
    }

    fn filled_event(seq: u64, order_id: &str, side: OrderSide, price: f64, qty: f64) -> Event {
        Event {
            seq,
            timestamp: Utc::now(),
            kind: EventKind::OrderFilled,
            payload: serde_json::to_value(OrderFilledPayload {
                order_id: order_id.to_string(),
                fill: FillEvent {
                    fill_id: format!("fill-{}", seq),
                    exchange_order_id: format!("ex-{}", order_id),
                    pair: "BTC/USD".to_string(),
                    side,
                    price,
                    quantity: qty,
                    fee: None,
                    timestamp: Utc::now(),
                },
                fee: 0.05,
                completed: true,
            })
            .unwrap(),
        }
    }

    #[test]
    fn test_replay_rebuilds_ledger_and_position() {
        let events = vec![
            setup_event(1),
            placed_event(2, "g-4", 4, OrderSide::Buy, 29000.0),
            placed_event(3, "g-5", 5, OrderSide::Sell, 30000.0),
            filled_event(4, "g-4", OrderSide::Buy, 29000.0, 0.001),
        ];

        let state = replay_events(&events).unwrap();

        assert_eq!(state.pair, "BTC/USD");
        assert_eq!(state.ladder.len(), 11);
        // g-4已成交释放档位，g-5仍在场
        assert_eq!(state.ledger.active_count(), 1);
        assert!(state.ledger.is_level_free(4));
        assert!(!state.ledger.is_level_free(5));
        assert!((state.position.inventory() - 0.001).abs() < 1e-12);
        assert!((state.position.fees_paid() - 0.05).abs() < 1e-12);
        assert_eq!(state.last_seq, 4);
        assert!(state.last_fill_time.is_some());
    }

    #[test]
    fn test_replay_twice_reproduces_identical_state() {
        let events = vec![
            setup_event(1),
            placed_event(2, "g-4", 4, OrderSide::Buy, 29000.0),
            filled_event(3, "g-4", OrderSide::Buy, 29000.0, 0.001),
            placed_event(4, "g-5", 5, OrderSide::Sell, 30000.0),
        ];

        let first = replay_events(&events).unwrap();
        let second = replay_events(&events).unwrap();

        assert_eq!(first.ledger.active_count(), second.ledger.active_count());
        assert_eq!(first.ledger.order_count(), second.ledger.order_count());
        assert_eq!(first.position.inventory(), second.position.inventory());
        assert_eq!(first.position.realized_pnl(), second.position.realized_pnl());
    }

    #[test]
    fn test_replay_requires_setup_first() {
        let events = vec![placed_event(1, "g-4", 4, OrderSide::Buy, 29000.0)];
        assert!(matches!(
            replay_events(&events),
            Err(GridError::JournalError(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_adopts_exchange_only_order() {
        let events = vec![setup_event(1)];
        let mut state = replay_events(&events).unwrap();

        let gateway = StubGateway {
            open_orders: vec![OpenOrder {
                exchange_order_id: "ex-foreign".to_string(),
                pair: "BTC/USD".to_string(),
                side: OrderSide::Sell,
                price: 31000.0,
                quantity: 0.001,
                filled_quantity: 0.0,
                timestamp: Utc::now(),
            }],
            fills: Vec::new(),
        };

        let dir = tempfile::tempdir().unwrap();
        let mut journal = EventJournal::open(dir.path().to_str().unwrap(), "s1").unwrap();

        let report = catch_up_and_reconcile(
            &gateway,
            &mut journal,
            &state.ladder,
            &mut state.ledger,
            &mut state.position,
            "BTC/USD",
            Utc::now(),
            0.0016,
        )
        .await
        .unwrap();

        assert_eq!(report.adopted, 1);
        let adopted = state.ledger.find_by_exchange_id("ex-foreign").unwrap();
        // 31000对应6档
        assert_eq!(adopted.level_index, 6);
        assert_eq!(adopted.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn test_reconcile_marks_missing_order_cancelled() {
        let events = vec![
            setup_event(1),
            placed_event(2, "g-4", 4, OrderSide::Buy, 29000.0),
        ];
        let mut state = replay_events(&events).unwrap();

        let gateway = StubGateway {
            open_orders: Vec::new(),
            fills: Vec::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let mut journal = EventJournal::open(dir.path().to_str().unwrap(), "s2").unwrap();

        let report = catch_up_and_reconcile(
            &gateway,
            &mut journal,
            &state.ladder,
            &mut state.ledger,
            &mut state.position,
            "BTC/USD",
            Utc::now(),
            0.0016,
        )
        .await
        .unwrap();

        assert_eq!(report.externally_cancelled, 1);
        assert_eq!(state.ledger.get("g-4").unwrap().status, OrderStatus::Cancelled);
        assert!(state.ledger.is_level_free(4));
    }

    #[tokio::test]
    async fn test_downtime_fill_applied_not_mislabelled() {
        // 崩溃前29000挂了买单，停机期间全部成交
        let events = vec![
            setup_event(1),
            placed_event(2, "g-4", 4, OrderSide::Buy, 29000.0),
        ];
        let mut state = replay_events(&events).unwrap();

        let gateway = StubGateway {
            open_orders: Vec::new(),
            fills: vec![FillEvent {
                fill_id: "dt-1".to_string(),
                exchange_order_id: "ex-g-4".to_string(),
                pair: "BTC/USD".to_string(),
                side: OrderSide::Buy,
                price: 29000.0,
                quantity: 0.001,
                fee: Some(0.05),
                timestamp: Utc::now(),
            }],
        };
        let dir = tempfile::tempdir().unwrap();
        let mut journal = EventJournal::open(dir.path().to_str().unwrap(), "s3").unwrap();

        let report = catch_up_and_reconcile(
            &gateway,
            &mut journal,
            &state.ladder,
            &mut state.ledger,
            &mut state.position,
            "BTC/USD",
            Utc::now(),
            0.0016,
        )
        .await
        .unwrap();

        // 成交入账而不是误判为外部撤销
        assert_eq!(report.caught_up_fills, 1);
        assert_eq!(report.externally_cancelled, 0);
        assert_eq!(state.ledger.get("g-4").unwrap().status, OrderStatus::Filled);
        assert!((state.position.inventory() - 0.001).abs() < 1e-12);
        // 对手卖单提案等待会话激活后下达
        assert_eq!(report.pending_counters.len(), 1);
        assert_eq!(report.pending_counters[0].level_index, 5);
        assert_eq!(report.pending_counters[0].side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_adopt_falls_back_to_nearest_free_level() {
        let events = vec![
            setup_event(1),
            placed_event(2, "g-6", 6, OrderSide::Sell, 31000.0),
        ];
        let mut state = replay_events(&events).unwrap();

        let gateway = StubGateway {
            open_orders: vec![
                OpenOrder {
                    exchange_order_id: "ex-g-6".to_string(),
                    pair: "BTC/USD".to_string(),
                    side: OrderSide::Sell,
                    price: 31000.0,
                    quantity: 0.001,
                    filled_quantity: 0.0,
                    timestamp: Utc::now(),
                },
                // 价格也落在6档附近，但6档被占，应挂到相邻空闲档
                OpenOrder {
                    exchange_order_id: "ex-foreign".to_string(),
                    pair: "BTC/USD".to_string(),
                    side: OrderSide::Sell,
                    price: 31100.0,
                    quantity: 0.001,
                    filled_quantity: 0.0,
                    timestamp: Utc::now(),
                },
            ],
            fills: Vec::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let mut journal = EventJournal::open(dir.path().to_str().unwrap(), "s4").unwrap();

        let report = catch_up_and_reconcile(
            &gateway,
            &mut journal,
            &state.ladder,
            &mut state.ledger,
            &mut state.position,
            "BTC/USD",
            Utc::now(),
            0.0016,
        )
        .await
        .unwrap();

        assert_eq!(report.adopted, 1);
        let adopted = state.ledger.find_by_exchange_id("ex-foreign").unwrap();
        // 6档被占，31100就近挂到7档(32000)
        assert_eq!(adopted.level_index, 7);
    }
}
