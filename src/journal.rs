use crate::core::config::GridConfig;
use crate::core::error::GridError;
use crate::core::types::{FillEvent, GridOrder, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// 本地事件日志：恢复的唯一事实来源
/// 按行追加JSON，seq严格递增，每次写入立即落盘
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Setup,
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    PositionUpdate,
    Error,
}

/// setup事件载荷：重放时据此确定性地重建同一座阶梯
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupPayload {
    pub session_id: String,
    pub pair: String,
    pub exchange: String,
    pub reference_price: f64,
    pub config: GridConfig,
    /// 建仓时的每周期收益估算，仅作审计参考
    #[serde(default)]
    pub cycle_estimate: Option<crate::engine::planner::CycleEstimate>,
}

/// order_placed事件载荷：网关确认受理后的订单快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedPayload {
    pub order: GridOrder,
}

/// order_filled事件载荷
/// fee为本笔实际计入的手续费，重放时直接采用，不再按费率估算
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFilledPayload {
    pub order_id: String,
    pub fill: FillEvent,
    pub fee: f64,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledPayload {
    pub order_id: String,
    pub exchange_order_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub context: Option<String>,
}

pub struct EventJournal {
    path: PathBuf,
    writer: BufWriter<File>,
    next_seq: u64,
}

impl EventJournal {
    /// 会话日志文件路径
    pub fn file_path(dir: &str, session_id: &str) -> PathBuf {
        Path::new(dir).join(format!("grid_{}.jsonl", session_id))
    }

    /// 打开（或续写）会话日志；已有文件时从末尾的seq继续
    pub fn open(dir: &str, session_id: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = Self::file_path(dir, session_id);

        let next_seq = if path.exists() {
            let events = Self::replay(&path)?;
            events.last().map(|event| event.seq + 1).unwrap_or(1)
        } else {
            1
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_seq,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一条事件并立即落盘，返回写入的事件
    pub fn append(&mut self, kind: EventKind, payload: serde_json::Value) -> Result<Event> {
        let event = Event {
            seq: self.next_seq,
            timestamp: Utc::now(),
            kind,
            payload,
        };

        let line = serde_json::to_string(&event)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        self.next_seq += 1;
        Ok(event)
    }

    /// 确保缓冲区清空（关闭前调用）
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// 顺序读回全部事件，校验seq单调递增
    /// 末尾允许出现一条写了一半的脏行（进程在写入中途被杀）
    pub fn replay(path: &Path) -> Result<Vec<Event>> {
        let contents = fs::read_to_string(path)?;
        let lines: Vec<&str> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();

        let mut events: Vec<Event> = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => {
                    if let Some(prev) = events.last() {
                        if event.seq <= prev.seq {
                            return Err(GridError::JournalError(format!(
                                "事件seq非递增: {} 之后出现 {}",
                                prev.seq, event.seq
                            )));
                        }
                    }
                    events.push(event);
                }
                Err(e) => {
                    if idx == lines.len() - 1 {
                        log::warn!("⚠️ 日志末尾存在不完整事件行，已跳过: {}", e);
                        break;
                    }
                    return Err(GridError::JournalError(format!(
                        "第{}行事件损坏: {}",
                        idx + 1,
                        e
                    )));
                }
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        let mut journal = EventJournal::open(dir_str, "s1").unwrap();
        journal
            .append(EventKind::Setup, serde_json::json!({"pair": "BTC/USD"}))
            .unwrap();
        journal
            .append(
                EventKind::OrderPlaced,
                serde_json::json!({"order_id": "g1", "price": 29000.0}),
            )
            .unwrap();
        journal
            .append(EventKind::Error, serde_json::json!({"message": "x"}))
            .unwrap();
        drop(journal);

        let path = EventJournal::file_path(dir_str, "s1");
        let events = EventJournal::replay(&path).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(events[1].kind, EventKind::OrderPlaced);
        assert_eq!(events[1].payload["order_id"], "g1");
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        {
            let mut journal = EventJournal::open(dir_str, "s2").unwrap();
            journal.append(EventKind::Setup, serde_json::json!({})).unwrap();
            journal
                .append(EventKind::OrderPlaced, serde_json::json!({}))
                .unwrap();
        }

        let mut journal = EventJournal::open(dir_str, "s2").unwrap();
        let event = journal
            .append(EventKind::OrderFilled, serde_json::json!({}))
            .unwrap();
        assert_eq!(event.seq, 3);
    }

    #[test]
    fn test_replay_tolerates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        {
            let mut journal = EventJournal::open(dir_str, "s3").unwrap();
            journal.append(EventKind::Setup, serde_json::json!({})).unwrap();
        }

        let path = EventJournal::file_path(dir_str, "s3");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":2,\"timesta").unwrap();

        let events = EventJournal::replay(&path).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_replay_rejects_non_monotonic_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        let line = |seq: u64| {
            format!(
                "{{\"seq\":{},\"timestamp\":\"2026-01-01T00:00:00Z\",\"kind\":\"setup\",\"payload\":{{}}}}\n",
                seq
            )
        };
        fs::write(&path, format!("{}{}{}", line(1), line(1), line(2))).unwrap();

        assert!(EventJournal::replay(&path).is_err());
    }
}
