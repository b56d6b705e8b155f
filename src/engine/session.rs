//! 网格会话模块
//!
//! 会话聚合了阶梯、账本、持仓与风控，驱动唯一的交易循环：
//! 拉行情、做持续风控、拉成交、持锁应用成交、锁外下对手单。
//! 账本的全部变更都发生在这一个任务里，事件日志因此保持严格有序。

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::core::config::GridConfig;
use crate::core::error::GridError;
use crate::core::gateway::ExchangeGateway;
use crate::core::retry_policy::{ExponentialBackoffRetry, RetryConfig};
use crate::core::types::{
    FillEvent, GridOrder, OpenOrder, OrderRequest, Result, SessionStatus,
};
use crate::engine::ledger::OrderLedger;
use crate::engine::planner::{build_ladder, estimate_cycle_profit, quantity_for_level, GridLadder};
use crate::engine::position::{PositionSnapshot, PositionTracker};
use crate::engine::reactor::{self, CounterDecision, CounterProposal};
use crate::engine::recovery;
use crate::engine::risk::{RiskAction, RiskGuard};
use crate::journal::{
    ErrorPayload, EventJournal, EventKind, OrderCancelledPayload, OrderFilledPayload,
    OrderPlacedPayload, SetupPayload,
};
use crate::persist::{FillRecord, OrderRecord, PositionRecord, SessionRecord, SinkHandle};
use crate::utils::{generate_session_id, OrderIdGenerator};

/// 会话的可变状态，整体挂在一把锁后面
/// 成交应用与下单登记都在持锁期间完成，对外永远是一致的快照
struct SessionState {
    status: SessionStatus,
    ledger: OrderLedger,
    position: PositionTracker,
    risk: RiskGuard,
    last_price: f64,
    last_fill_time: DateTime<Utc>,
    pause_reason: Option<String>,
}

/// 会话状态快照，供CLI展示与日志输出
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub pair: String,
    pub exchange: String,
    pub status: SessionStatus,
    pub last_price: f64,
    pub active_orders: usize,
    pub inventory: f64,
    pub avg_entry_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub fees_paid: f64,
    pub daily_pnl: f64,
    pub fill_count: u64,
    pub pause_reason: Option<String>,
}

impl SessionReport {
    /// 多行状态报告
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("📊 会话 {} [{:?}]", self.session_id, self.status),
            format!("├─ 交易对: {} @ {}", self.pair, self.exchange),
            format!("├─ 最新价: {:.2}", self.last_price),
            format!("├─ 在场订单: {}", self.active_orders),
            format!(
                "├─ 持仓: {:.8} (均价 {:.2})",
                self.inventory, self.avg_entry_price
            ),
            format!(
                "├─ 已实现盈亏: 毛 {:.4} / 净 {:.4} (手续费 {:.4})",
                self.realized_pnl,
                self.realized_pnl - self.fees_paid,
                self.fees_paid
            ),
            format!("├─ 未实现盈亏: {:.4}", self.unrealized_pnl),
        ];
        if let Some(reason) = &self.pause_reason {
            lines.push(format!("├─ 暂停原因: {}", reason));
        }
        lines.push(format!("└─ 今日盈亏: {:.4}", self.daily_pnl));
        lines.join("\n")
    }
}

/// 网格交易会话
pub struct GridSession {
    session_id: String,
    pair: String,
    exchange: String,
    config: Arc<GridConfig>,
    ladder: Arc<GridLadder>,
    gateway: Arc<dyn ExchangeGateway>,
    sink: SinkHandle,
    state: Mutex<SessionState>,
    journal: Mutex<EventJournal>,
    running: RwLock<bool>,
    stop_notify: Notify,
    retry: ExponentialBackoffRetry,
    order_ids: OrderIdGenerator,
    /// 启动前排队的下单提案：新会话是整座阶梯，恢复会话是补追成交的对手单
    pending_proposals: Mutex<Vec<CounterProposal>>,
    created_at: DateTime<Utc>,
}

impl GridSession {
    /// 创建新会话：取参考价、建阶梯、写setup事件
    /// 初始挂单在进入交易循环时才下达
    pub async fn create(
        config: Arc<GridConfig>,
        pair: String,
        gateway: Arc<dyn ExchangeGateway>,
        sink: SinkHandle,
    ) -> Result<Self> {
        let ticker = gateway.get_ticker(&pair).await?;
        let reference_price = ticker.last;
        let ladder = build_ladder(&config, reference_price)?;
        let estimate = estimate_cycle_profit(&config, &ladder);

        let session_id = generate_session_id(&pair);
        let exchange = gateway.name().to_string();
        let mut journal = EventJournal::open(&config.journal.dir, &session_id)?;
        journal.append(
            EventKind::Setup,
            serde_json::to_value(SetupPayload {
                session_id: session_id.clone(),
                pair: pair.clone(),
                exchange: exchange.clone(),
                reference_price,
                config: (*config).clone(),
                cycle_estimate: estimate.clone(),
            })?,
        )?;

        info!(
            "✅ 会话{}已创建: {} @ {} 参考价 {:.2}",
            session_id, pair, exchange, reference_price
        );
        info!(
            "├─ 网格区间: [{:.2}, {:.2}] 共{}档",
            ladder.lower_bound,
            ladder.upper_bound,
            ladder.len()
        );
        if let Some(estimate) = &estimate {
            info!(
                "└─ 每周期收益估算: 毛利 {:.4} / 净利 {:.4}",
                estimate.gross_profit, estimate.net_profit
            );
        }

        // 新会话的初始挂单覆盖整座阶梯，离参考价最近的档位先挂
        let mut initial: Vec<CounterProposal> = ladder
            .levels()
            .iter()
            .map(|level| CounterProposal {
                level_index: level.index,
                side: level.side,
                price: level.price,
                quantity: quantity_for_level(&config, level.price),
            })
            .collect();
        initial.sort_by(|a, b| {
            let da = (a.price - reference_price).abs();
            let db = (b.price - reference_price).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });

        let risk = RiskGuard::new(&config);
        let created_at = Utc::now();
        let session = Self {
            order_ids: OrderIdGenerator::new(&session_id),
            session_id: session_id.clone(),
            pair: pair.clone(),
            exchange: exchange.clone(),
            ladder: Arc::new(ladder),
            gateway,
            sink,
            state: Mutex::new(SessionState {
                status: SessionStatus::Active,
                ledger: OrderLedger::new(),
                position: PositionTracker::new(pair),
                risk,
                last_price: reference_price,
                last_fill_time: created_at,
                pause_reason: None,
            }),
            journal: Mutex::new(journal),
            running: RwLock::new(false),
            stop_notify: Notify::new(),
            retry: ExponentialBackoffRetry::new(RetryConfig::default()),
            pending_proposals: Mutex::new(initial),
            created_at,
            config,
        };
        session.push_session_record().await;
        Ok(session)
    }

    /// 从事件日志恢复会话：重放、补追成交、与交易所对账
    pub async fn recover(
        config: Arc<GridConfig>,
        session_id: &str,
        gateway: Arc<dyn ExchangeGateway>,
        sink: SinkHandle,
    ) -> Result<Self> {
        let path = EventJournal::file_path(&config.journal.dir, session_id);
        let events = EventJournal::replay(&path)?;
        let replayed = recovery::replay_events(&events)?;

        let setup_grid = &replayed.setup_config.grid;
        if (config.grid.lower_bound - setup_grid.lower_bound).abs() > f64::EPSILON
            || (config.grid.upper_bound - setup_grid.upper_bound).abs() > f64::EPSILON
            || (config.grid.spacing_value - setup_grid.spacing_value).abs() > f64::EPSILON
        {
            warn!("⚠️ 当前配置与会话创建时的网格参数不一致，阶梯仍按创建时的参数重建");
        }

        let mut journal = EventJournal::open(&config.journal.dir, session_id)?;
        let mut ledger = replayed.ledger;
        let mut position = replayed.position;

        // 补追游标：最后一笔已入账成交的时间，没有成交过就从setup时刻开始
        let since = replayed
            .last_fill_time
            .or_else(|| events.first().map(|event| event.timestamp))
            .unwrap_or_else(Utc::now);

        let report = recovery::catch_up_and_reconcile(
            gateway.as_ref(),
            &mut journal,
            &replayed.ladder,
            &mut ledger,
            &mut position,
            &replayed.pair,
            since,
            config.effective_fee_rate(),
        )
        .await?;

        info!(
            "✅ 会话{}恢复完成: 在场订单{}个, 持仓{:.8}, 待补对手单{}个",
            session_id,
            ledger.active_count(),
            position.inventory(),
            report.pending_counters.len()
        );

        let order_ids = OrderIdGenerator::resume_from(session_id, ledger.order_count() as u64);
        let created_at = Utc::now();
        let session = Self {
            order_ids,
            session_id: session_id.to_string(),
            pair: replayed.pair.clone(),
            exchange: replayed.exchange.clone(),
            ladder: Arc::new(replayed.ladder),
            gateway,
            sink,
            state: Mutex::new(SessionState {
                status: SessionStatus::Active,
                ledger,
                position,
                risk: RiskGuard::new(&config),
                last_price: replayed.reference_price,
                last_fill_time: replayed.last_fill_time.unwrap_or(created_at),
                pause_reason: None,
            }),
            journal: Mutex::new(journal),
            running: RwLock::new(false),
            stop_notify: Notify::new(),
            retry: ExponentialBackoffRetry::new(RetryConfig::default()),
            pending_proposals: Mutex::new(report.pending_counters),
            created_at,
            config,
        };
        session.push_session_record().await;
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    pub fn ladder(&self) -> &GridLadder {
        &self.ladder
    }

    /// 交易主循环，直到收到停止请求
    pub async fn run(&self) -> Result<()> {
        self.run_loop(None).await
    }

    /// 运行固定周期数后停止（dry-run用）
    pub async fn run_cycles(&self, cycles: u64) -> Result<()> {
        self.run_loop(Some(cycles)).await
    }

    async fn run_loop(&self, max_cycles: Option<u64>) -> Result<()> {
        *self.running.write().await = true;
        self.arm_pending().await;

        let interval = Duration::from_secs(self.config.execution.poll_interval_secs);
        info!(
            "🔄 会话{}进入交易循环, 轮询间隔{}秒",
            self.session_id,
            interval.as_secs()
        );

        let mut cycle: u64 = 0;
        loop {
            if !*self.running.read().await {
                info!("ℹ️ 会话{}收到停止请求，退出交易循环", self.session_id);
                break;
            }
            if let Some(max) = max_cycles {
                if cycle >= max {
                    info!("ℹ️ 会话{}已完成{}个轮询周期", self.session_id, max);
                    break;
                }
            }
            cycle += 1;

            if let Err(e) = self.tick().await {
                // 日志写不进去就没有恢复依据了，必须停下来
                if matches!(e, GridError::JournalError(_) | GridError::IoError(_)) {
                    error!("❌ 会话{}事件日志写入失败，停止交易: {}", self.session_id, e);
                    break;
                }
                error!("❌ 会话{}第{}个周期执行失败: {}", self.session_id, cycle, e);
            }
            self.log_cycle_status(cycle).await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.stop_notify.notified() => {}
            }
        }

        self.shutdown().await
    }

    /// 请求停止：置停止标志并打断当前休眠，循环在本周期末退出
    pub async fn request_stop(&self) {
        *self.running.write().await = false;
        self.stop_notify.notify_one();
    }

    /// 下达所有排队中的下单提案
    async fn arm_pending(&self) {
        let pending: Vec<CounterProposal> = {
            let mut queue = self.pending_proposals.lock().await;
            queue.drain(..).collect()
        };
        if !pending.is_empty() {
            info!("🔄 会话{}下达{}个排队订单", self.session_id, pending.len());
            self.place_proposals(pending).await;
        }
    }

    /// 单个轮询周期：行情、持续风控、成交应用、对手单下达
    async fn tick(&self) -> Result<()> {
        let gateway = self.gateway.clone();
        let pair = self.pair.clone();
        let ticker = match self
            .retry
            .execute_with_retry(|| {
                let gateway = gateway.clone();
                let pair = pair.clone();
                async move { gateway.get_ticker(&pair).await }
            })
            .await
        {
            Ok(ticker) => {
                self.state.lock().await.risk.record_gateway_success();
                ticker
            }
            Err(e) => {
                self.handle_gateway_failure("获取行情", e).await?;
                return Ok(());
            }
        };

        let action = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.last_price = ticker.last;
            if state.status == SessionStatus::Active {
                let daily = state.position.daily_pnl(ticker.last, Utc::now());
                state.risk.continuous_check(ticker.last, daily)
            } else {
                None
            }
        };
        if let Some(action) = action {
            self.apply_risk_action(action).await?;
        }

        let since = { self.state.lock().await.last_fill_time };
        let gateway = self.gateway.clone();
        let pair = self.pair.clone();
        let fills = match self
            .retry
            .execute_with_retry(|| {
                let gateway = gateway.clone();
                let pair = pair.clone();
                async move { gateway.poll_fills(&pair, since).await }
            })
            .await
        {
            Ok(fills) => {
                self.state.lock().await.risk.record_gateway_success();
                fills
            }
            Err(e) => {
                self.handle_gateway_failure("拉取成交", e).await?;
                return Ok(());
            }
        };

        let proposals = self.process_fills(&fills).await?;
        self.place_proposals(proposals).await;
        Ok(())
    }

    /// 持锁应用一批成交，返回锁外下达的对手单提案
    async fn process_fills(&self, fills: &[FillEvent]) -> Result<Vec<CounterProposal>> {
        if fills.is_empty() {
            return Ok(Vec::new());
        }

        let fee_rate = self.config.effective_fee_rate();
        let mut proposals = Vec::new();
        let mut entries: Vec<(EventKind, serde_json::Value)> = Vec::new();
        let mut fill_records: Vec<FillRecord> = Vec::new();
        let mut order_records: Vec<OrderRecord> = Vec::new();
        let mut position_record: Option<PositionRecord> = None;
        let mut applied = 0u32;

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            for fill in fills {
                let order_id = state
                    .ledger
                    .find_by_exchange_id(&fill.exchange_order_id)
                    .map(|order| order.id.clone());
                let application = reactor::apply_fill(
                    &self.ladder,
                    &mut state.ledger,
                    &mut state.position,
                    fill,
                    fee_rate,
                );

                match &application.decision {
                    CounterDecision::Duplicate => continue,
                    CounterDecision::Unknown => {
                        let message = format!("成交{}无法匹配任何账本订单", fill.fill_id);
                        warn!("⚠️ {}", GridError::ReconciliationMismatch(message.clone()));
                        entries.push((
                            EventKind::Error,
                            serde_json::to_value(ErrorPayload {
                                message,
                                context: Some("fill".to_string()),
                            })?,
                        ));
                        continue;
                    }
                    _ => {}
                }

                applied += 1;
                if fill.timestamp > state.last_fill_time {
                    state.last_fill_time = fill.timestamp;
                }

                entries.push((
                    EventKind::OrderFilled,
                    serde_json::to_value(OrderFilledPayload {
                        order_id: order_id.unwrap_or_default(),
                        fill: fill.clone(),
                        fee: application.fee,
                        completed: application.completed_order.is_some(),
                    })?,
                ));
                fill_records.push(FillRecord {
                    session_id: self.session_id.clone(),
                    fee: application.fee,
                    fill: fill.clone(),
                });
                if let Some(order) = state
                    .ledger
                    .find_by_exchange_id(&fill.exchange_order_id)
                    .cloned()
                {
                    order_records.push(OrderRecord {
                        session_id: self.session_id.clone(),
                        order,
                    });
                }

                match application.decision {
                    CounterDecision::Proposed(proposal) => proposals.push(proposal),
                    CounterDecision::LevelOccupied { level_index } => {
                        entries.push((
                            EventKind::Error,
                            serde_json::to_value(ErrorPayload {
                                message: format!("对手档位{}已被占用，跳过补挂", level_index),
                                context: Some("risk".to_string()),
                            })?,
                        ));
                    }
                    _ => {}
                }
            }

            if applied > 0 {
                let snapshot = state.position.snapshot(state.last_price);
                entries.push((EventKind::PositionUpdate, serde_json::to_value(&snapshot)?));
                position_record = Some(PositionRecord {
                    session_id: self.session_id.clone(),
                    updated_at: Utc::now(),
                    snapshot,
                });
            }
        }

        if !entries.is_empty() {
            let mut journal = self.journal.lock().await;
            for (kind, payload) in entries {
                journal.append(kind, payload)?;
            }
        }
        for record in fill_records {
            self.sink.upsert_fill(record);
        }
        for record in order_records {
            self.sink.upsert_order(record);
        }
        if let Some(record) = position_record {
            self.sink.upsert_position(record);
        }

        Ok(proposals)
    }

    /// 逐个下达提案，风控拒绝只记事件不中断
    async fn place_proposals(&self, proposals: Vec<CounterProposal>) {
        for proposal in proposals {
            if let Err(e) = self.place_one(&proposal).await {
                match e {
                    GridError::RiskViolation(reason) => {
                        info!("ℹ️ 跳过档位{}下单: {}", proposal.level_index, reason);
                        if let Err(journal_err) = self
                            .journal_error(
                                format!("档位{}下单被风控跳过: {}", proposal.level_index, reason),
                                Some("risk"),
                            )
                            .await
                        {
                            warn!("⚠️ 风控事件写入失败: {}", journal_err);
                        }
                    }
                    other => {
                        warn!("⚠️ 档位{}下单失败: {}", proposal.level_index, other);
                    }
                }
            }
        }
    }

    /// 下达单个订单：持锁校验并登记，锁外走网关，回写时再校验会话状态
    async fn place_one(&self, proposal: &CounterProposal) -> Result<()> {
        let order = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.risk.pre_trade_check(
                state.status,
                proposal.side,
                proposal.price,
                proposal.quantity,
                &state.position,
            )?;
            if !state.ledger.is_level_free(proposal.level_index) {
                return Err(GridError::RiskViolation(format!(
                    "档位{}已被占用",
                    proposal.level_index
                )));
            }
            let order = GridOrder::new(
                self.order_ids.next(proposal.level_index),
                proposal.level_index,
                proposal.side,
                proposal.price,
                proposal.quantity,
            );
            state.ledger.register(order.clone())?;
            order
        };

        let request = OrderRequest::new(
            self.pair.clone(),
            order.side,
            order.price,
            order.quantity,
        )
        .with_client_id(order.id.clone());

        let gateway = self.gateway.clone();
        let result = self
            .retry
            .execute_with_retry(|| {
                let gateway = gateway.clone();
                let request = request.clone();
                async move { gateway.place_order(&request).await }
            })
            .await;

        match result {
            Ok(exchange_order_id) => {
                let placed = {
                    let mut guard = self.state.lock().await;
                    let state = &mut *guard;
                    state.risk.record_gateway_success();
                    if state.status == SessionStatus::Active {
                        state.ledger.mark_open(&order.id, exchange_order_id.clone())?;
                        state.ledger.get(&order.id).cloned()
                    } else {
                        None
                    }
                };
                match placed {
                    Some(placed) => {
                        info!(
                            "✅ 档位{}挂单: {} {:.8} @ {:.2} (交易所订单{})",
                            proposal.level_index,
                            placed.side,
                            placed.quantity,
                            placed.price,
                            exchange_order_id
                        );
                        self.journal_append(
                            EventKind::OrderPlaced,
                            serde_json::to_value(OrderPlacedPayload {
                                order: placed.clone(),
                            })?,
                        )
                        .await?;
                        self.sink.upsert_order(OrderRecord {
                            session_id: self.session_id.clone(),
                            order: placed,
                        });
                        Ok(())
                    }
                    None => {
                        // 下单期间会话被暂停，立即撤回这笔订单
                        warn!(
                            "⚠️ 会话已暂停，撤回刚下达的订单{}",
                            exchange_order_id
                        );
                        if let Err(e) = self
                            .gateway
                            .cancel_order(&exchange_order_id, &self.pair)
                            .await
                        {
                            warn!("⚠️ 撤回订单{}失败: {}", exchange_order_id, e);
                        }
                        let mut guard = self.state.lock().await;
                        if let Err(e) = guard.ledger.mark_rejected(&order.id) {
                            warn!("⚠️ 订单{}状态回退失败: {}", order.id, e);
                        }
                        Ok(())
                    }
                }
            }
            Err(e) => {
                let (rejected, action) = {
                    let mut guard = self.state.lock().await;
                    let state = &mut *guard;
                    let rejected = state.ledger.mark_rejected(&order.id).ok();
                    let action = state.risk.record_gateway_failure(Utc::now());
                    (rejected, action)
                };
                self.journal_error(
                    format!("档位{}下单失败: {}", proposal.level_index, e),
                    Some("gateway"),
                )
                .await?;
                if let Some(rejected) = rejected {
                    self.sink.upsert_order(OrderRecord {
                        session_id: self.session_id.clone(),
                        order: rejected,
                    });
                }
                if let Some(action) = action {
                    self.apply_risk_action(action).await?;
                }
                Err(e)
            }
        }
    }

    /// 网关调用（重试耗尽后）失败的统一出口：计入熔断窗口
    async fn handle_gateway_failure(&self, operation: &str, error: GridError) -> Result<()> {
        warn!("⚠️ {}失败: {}", operation, error);
        let action = {
            self.state
                .lock()
                .await
                .risk
                .record_gateway_failure(Utc::now())
        };
        if let Some(action) = action {
            self.apply_risk_action(action).await?;
        }
        Ok(())
    }

    /// 执行风控动作并写入事件日志
    async fn apply_risk_action(&self, action: RiskAction) -> Result<()> {
        match action {
            RiskAction::KillSwitch(reason) => {
                error!("⛔ 风控熔断: {}，撤销全部挂单并暂停会话", reason);
                self.journal_error(format!("风控熔断: {}", reason), Some("risk"))
                    .await?;
                self.pause(reason, true).await
            }
            RiskAction::Pause(reason) => {
                warn!("⛔ 会话暂停: {}", reason);
                self.journal_error(format!("会话暂停: {}", reason), Some("risk"))
                    .await?;
                self.pause(reason, self.config.risk.cancel_on_pause).await
            }
        }
    }

    /// 转入Paused。暂停后成交照常入账，新订单一律被风控拒绝
    async fn pause(&self, reason: String, cancel_orders: bool) -> Result<()> {
        {
            let mut guard = self.state.lock().await;
            if guard.status == SessionStatus::Stopped {
                return Ok(());
            }
            guard.status = SessionStatus::Paused;
            guard.pause_reason = Some(reason);
        }
        if cancel_orders {
            self.cancel_all_active("风控暂停撤单").await?;
        }
        self.push_session_record().await;
        Ok(())
    }

    /// 撤销全部在场订单并写order_cancelled事件
    async fn cancel_all_active(&self, reason: &str) -> Result<()> {
        let targets: Vec<(String, String)> = {
            let guard = self.state.lock().await;
            guard
                .ledger
                .active_orders()
                .iter()
                .filter_map(|order| {
                    order
                        .exchange_order_id
                        .clone()
                        .map(|exchange_id| (order.id.clone(), exchange_id))
                })
                .collect()
        };

        let mut cancelled = 0u32;
        for (order_id, exchange_order_id) in targets {
            match self.gateway.cancel_order(&exchange_order_id, &self.pair).await {
                Ok(()) => {
                    let order = {
                        let mut guard = self.state.lock().await;
                        guard.ledger.mark_cancelled(&order_id).ok()
                    };
                    if let Some(order) = order {
                        cancelled += 1;
                        self.journal_append(
                            EventKind::OrderCancelled,
                            serde_json::to_value(OrderCancelledPayload {
                                order_id: order.id.clone(),
                                exchange_order_id: order.exchange_order_id.clone(),
                                reason: reason.to_string(),
                            })?,
                        )
                        .await?;
                        self.sink.upsert_order(OrderRecord {
                            session_id: self.session_id.clone(),
                            order,
                        });
                    }
                }
                Err(e) => {
                    warn!("⚠️ 撤销订单{}失败: {}", exchange_order_id, e);
                }
            }
        }
        if cancelled > 0 {
            info!("✅ 已撤销{}笔在场订单: {}", cancelled, reason);
        }
        Ok(())
    }

    /// 停止流程：按配置撤单、写终态持仓、导出成交明细、落盘
    async fn shutdown(&self) -> Result<()> {
        info!("🔄 会话{}开始停止流程", self.session_id);
        {
            let mut guard = self.state.lock().await;
            guard.status = SessionStatus::Stopped;
        }
        if self.config.risk.cancel_on_stop {
            self.cancel_all_active("会话停止撤单").await?;
        }

        let snapshot = {
            let guard = self.state.lock().await;
            let snapshot = guard.position.snapshot(guard.last_price);
            let csv_path = Path::new(&self.config.journal.dir)
                .join(format!("fills_{}.csv", self.session_id));
            match guard.position.export_fills_csv(&csv_path) {
                Ok(()) => info!("📊 成交明细已导出: {}", csv_path.display()),
                Err(e) => warn!("⚠️ 成交明细导出失败: {}", e),
            }
            snapshot
        };
        {
            let mut journal = self.journal.lock().await;
            journal.append(
                EventKind::PositionUpdate,
                serde_json::to_value(&snapshot)?,
            )?;
            journal.flush()?;
        }
        self.sink.upsert_position(PositionRecord {
            session_id: self.session_id.clone(),
            updated_at: Utc::now(),
            snapshot,
        });
        self.push_session_record().await;
        info!("✅ 会话{}已停止", self.session_id);
        Ok(())
    }

    /// 当前状态快照
    pub async fn report(&self) -> SessionReport {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let daily = state.position.daily_pnl(state.last_price, Utc::now());
        SessionReport {
            session_id: self.session_id.clone(),
            pair: self.pair.clone(),
            exchange: self.exchange.clone(),
            status: state.status,
            last_price: state.last_price,
            active_orders: state.ledger.active_count(),
            inventory: state.position.inventory(),
            avg_entry_price: state.position.avg_entry_price(),
            realized_pnl: state.position.realized_pnl(),
            unrealized_pnl: state.position.unrealized_pnl(state.last_price),
            fees_paid: state.position.fees_paid(),
            daily_pnl: daily,
            fill_count: state.position.fill_count(),
            pause_reason: state.pause_reason.clone(),
        }
    }

    async fn log_cycle_status(&self, cycle: u64) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let daily = state.position.daily_pnl(state.last_price, Utc::now());
        info!(
            "📊 周期{:>4} | 价格 {:.2} | 在场 {} | 持仓 {:.8} | 已实现 {:.4} | 今日 {:.4}",
            cycle,
            state.last_price,
            state.ledger.active_count(),
            state.position.inventory(),
            state.position.realized_pnl(),
            daily
        );
    }

    async fn journal_append(&self, kind: EventKind, payload: serde_json::Value) -> Result<()> {
        let mut journal = self.journal.lock().await;
        journal.append(kind, payload)?;
        Ok(())
    }

    async fn journal_error(&self, message: String, context: Option<&str>) -> Result<()> {
        let payload = serde_json::to_value(ErrorPayload {
            message,
            context: context.map(|c| c.to_string()),
        })?;
        self.journal_append(EventKind::Error, payload).await
    }

    async fn push_session_record(&self) {
        let status = { self.state.lock().await.status };
        self.sink.upsert_session(SessionRecord {
            session_id: self.session_id.clone(),
            pair: self.pair.clone(),
            exchange: self.exchange.clone(),
            status,
            created_at: self.created_at,
            updated_at: Utc::now(),
        });
    }
}

/// 不在会话进程内的状态视图（status子命令用）
#[derive(Debug)]
pub struct SessionOverview {
    pub session_id: String,
    pub pair: String,
    pub exchange: String,
    pub events: usize,
    pub last_event_at: Option<DateTime<Utc>>,
    pub active_orders: Vec<GridOrder>,
    pub exchange_open_orders: Vec<OpenOrder>,
    pub snapshot: PositionSnapshot,
}

impl SessionOverview {
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("📊 会话 {} ({} @ {})", self.session_id, self.pair, self.exchange),
            format!(
                "├─ 事件日志: {}条{}",
                self.events,
                self.last_event_at
                    .map(|t| format!(", 最后写入 {}", t.to_rfc3339()))
                    .unwrap_or_default()
            ),
            format!(
                "├─ 持仓: {:.8} (均价 {:.2}) 已实现 毛 {:.4} / 净 {:.4} (手续费 {:.4})",
                self.snapshot.inventory,
                self.snapshot.avg_entry_price,
                self.snapshot.realized_pnl,
                self.snapshot.realized_pnl - self.snapshot.fees_paid,
                self.snapshot.fees_paid
            ),
            format!("├─ 账本在场订单: {}", self.active_orders.len()),
        ];
        for order in &self.active_orders {
            lines.push(format!(
                "│    {} {} {:.8} @ {:.2} [{:?}]",
                order.id, order.side, order.quantity, order.price, order.status
            ));
        }
        lines.push(format!(
            "└─ 交易所挂单: {}",
            self.exchange_open_orders.len()
        ));
        lines.join("\n")
    }
}

/// 读取日志并结合交易所现状，给出一个会话的离线视图
pub async fn inspect_session(
    config: &GridConfig,
    session_id: &str,
    gateway: &dyn ExchangeGateway,
) -> Result<SessionOverview> {
    let path = EventJournal::file_path(&config.journal.dir, session_id);
    let events = EventJournal::replay(&path)?;
    let replayed = recovery::replay_events(&events)?;

    let last_price = match gateway.get_ticker(&replayed.pair).await {
        Ok(ticker) => ticker.last,
        Err(e) => {
            warn!("⚠️ 获取行情失败，按参考价展示: {}", e);
            replayed.reference_price
        }
    };
    let exchange_open_orders = gateway
        .list_open_orders(&replayed.pair)
        .await
        .unwrap_or_else(|e| {
            warn!("⚠️ 获取交易所挂单失败: {}", e);
            Vec::new()
        });

    Ok(SessionOverview {
        session_id: replayed.session_id.clone(),
        pair: replayed.pair.clone(),
        exchange: replayed.exchange.clone(),
        events: events.len(),
        last_event_at: events.last().map(|event| event.timestamp),
        active_orders: replayed
            .ledger
            .active_orders()
            .into_iter()
            .cloned()
            .collect(),
        exchange_open_orders,
        snapshot: replayed.position.snapshot(last_price),
    })
}

/// 停止结果摘要
#[derive(Debug)]
pub struct HaltSummary {
    pub cancelled: u32,
    pub snapshot: PositionSnapshot,
    pub csv_path: PathBuf,
}

/// 进程外停止一个会话：撤掉交易对全部挂单、写终态事件、导出成交明细
pub async fn halt_session(
    config: &GridConfig,
    session_id: &str,
    gateway: &dyn ExchangeGateway,
) -> Result<HaltSummary> {
    let path = EventJournal::file_path(&config.journal.dir, session_id);
    let events = EventJournal::replay(&path)?;
    let mut replayed = recovery::replay_events(&events)?;
    let mut journal = EventJournal::open(&config.journal.dir, session_id)?;

    let cancelled = gateway.cancel_all_orders(&replayed.pair).await?;

    let active_ids: Vec<String> = replayed
        .ledger
        .active_orders()
        .iter()
        .map(|order| order.id.clone())
        .collect();
    for order_id in active_ids {
        if let Ok(order) = replayed.ledger.mark_cancelled(&order_id) {
            journal.append(
                EventKind::OrderCancelled,
                serde_json::to_value(OrderCancelledPayload {
                    order_id: order.id.clone(),
                    exchange_order_id: order.exchange_order_id.clone(),
                    reason: "停止会话撤单".to_string(),
                })?,
            )?;
        }
    }

    let last_price = match gateway.get_ticker(&replayed.pair).await {
        Ok(ticker) => ticker.last,
        Err(_) => replayed.reference_price,
    };
    let snapshot = replayed.position.snapshot(last_price);
    journal.append(EventKind::PositionUpdate, serde_json::to_value(&snapshot)?)?;
    journal.flush()?;

    let csv_path = Path::new(&config.journal.dir).join(format!("fills_{}.csv", session_id));
    replayed.position.export_fills_csv(&csv_path)?;

    info!(
        "✅ 会话{}已停止: 撤单{}笔, 成交明细已导出 {}",
        session_id,
        cancelled,
        csv_path.display()
    );
    Ok(HaltSummary {
        cancelled,
        snapshot,
        csv_path,
    })
}

/// 日志目录里最近更新的会话（stop/status缺省参数时用）
pub fn latest_session_id(dir: &str) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut newest: Option<(std::time::SystemTime, String)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let session_id = match name
            .strip_prefix("grid_")
            .and_then(|n| n.strip_suffix(".jsonl"))
        {
            Some(id) => id.to_string(),
            None => continue,
        };
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if newest
            .as_ref()
            .map_or(true, |(time, _)| modified > *time)
        {
            newest = Some((modified, session_id));
        }
    }
    newest.map(|(_, session_id)| session_id)
}
