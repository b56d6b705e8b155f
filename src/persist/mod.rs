//! 远端持久化模块
//! 尽力而为的状态镜像：投递即返回，失败或超时只记日志，绝不阻塞交易路径，
//! 恢复逻辑完全不依赖远端可达

use crate::core::types::{FillEvent, GridOrder, Result, SessionStatus};
use crate::engine::position::PositionSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod rest;

pub use rest::RestSink;

/// 会话镜像记录
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub pair: String,
    pub exchange: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 订单镜像记录，按订单ID覆写
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub session_id: String,
    #[serde(flatten)]
    pub order: GridOrder,
}

/// 成交镜像记录，按fill_id覆写
#[derive(Debug, Clone, Serialize)]
pub struct FillRecord {
    pub session_id: String,
    pub fee: f64,
    #[serde(flatten)]
    pub fill: FillEvent,
}

/// 持仓镜像记录
#[derive(Debug, Clone, Serialize)]
pub struct PositionRecord {
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub snapshot: PositionSnapshot,
}

/// 远端存储能力接口
/// 所有写入按 id 幂等覆写，重复投递无副作用
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert_session(&self, record: &SessionRecord) -> Result<()>;

    async fn upsert_order(&self, record: &OrderRecord) -> Result<()>;

    async fn upsert_fill(&self, record: &FillRecord) -> Result<()>;

    async fn upsert_position(&self, record: &PositionRecord) -> Result<()>;
}

/// 空实现：未配置远端存储时使用
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    async fn upsert_session(&self, _record: &SessionRecord) -> Result<()> {
        Ok(())
    }

    async fn upsert_order(&self, _record: &OrderRecord) -> Result<()> {
        Ok(())
    }

    async fn upsert_fill(&self, _record: &FillRecord) -> Result<()> {
        Ok(())
    }

    async fn upsert_position(&self, _record: &PositionRecord) -> Result<()> {
        Ok(())
    }
}

enum SinkCommand {
    Session(SessionRecord),
    Order(OrderRecord),
    Fill(FillRecord),
    Position(PositionRecord),
}

impl SinkCommand {
    fn describe(&self) -> &'static str {
        match self {
            SinkCommand::Session(_) => "session",
            SinkCommand::Order(_) => "order",
            SinkCommand::Fill(_) => "fill",
            SinkCommand::Position(_) => "position",
        }
    }
}

async fn dispatch(sink: &dyn PersistenceSink, command: &SinkCommand) -> Result<()> {
    match command {
        SinkCommand::Session(record) => sink.upsert_session(record).await,
        SinkCommand::Order(record) => sink.upsert_order(record).await,
        SinkCommand::Fill(record) => sink.upsert_fill(record).await,
        SinkCommand::Position(record) => sink.upsert_position(record).await,
    }
}

/// 交易路径持有的句柄：send完即返回，结果由后台任务消化
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<SinkCommand>,
}

impl SinkHandle {
    /// 启动后台写入任务，返回句柄与任务handle
    /// 句柄全部释放后任务自然退出，可await做收尾排空
    pub fn spawn(
        sink: Arc<dyn PersistenceSink>,
        timeout: Duration,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SinkCommand>();
        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match tokio::time::timeout(timeout, dispatch(sink.as_ref(), &command)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        "⚠️ 持久化写入{}失败({}): {}",
                        command.describe(),
                        sink.name(),
                        e
                    ),
                    Err(_) => warn!(
                        "⚠️ 持久化写入{}超时({})",
                        command.describe(),
                        sink.name()
                    ),
                }
            }
        });
        (Self { tx }, handle)
    }

    pub fn upsert_session(&self, record: SessionRecord) {
        let _ = self.tx.send(SinkCommand::Session(record));
    }

    pub fn upsert_order(&self, record: OrderRecord) {
        let _ = self.tx.send(SinkCommand::Order(record));
    }

    pub fn upsert_fill(&self, record: FillRecord) {
        let _ = self.tx.send(SinkCommand::Fill(record));
    }

    pub fn upsert_position(&self, record: PositionRecord) {
        let _ = self.tx.send(SinkCommand::Position(record));
    }
}
