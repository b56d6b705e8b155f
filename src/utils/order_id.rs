/// 订单ID生成器
///
/// 为会话内每笔订单生成唯一且可追溯的本地ID
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 会话ID: grid-<pair>-<毫秒时间戳>
pub fn generate_session_id(pair: &str) -> String {
    let compact: String = pair
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    format!("grid-{}-{}", compact, Utc::now().timestamp_millis())
}

/// 订单ID生成器
/// 生成形如 grid-<pair>-<ms>-L<档位>-<序号> 的ID，崩溃重启后序号段重新计数，
/// 时间戳段保证跨进程不冲突
pub struct OrderIdGenerator {
    session_id: String,
    sequence: AtomicU64,
}

impl OrderIdGenerator {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            sequence: AtomicU64::new(1),
        }
    }

    /// 为指定档位生成订单ID
    pub fn next(&self, level_index: usize) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!("{}-L{}-{}", self.session_id, level_index, seq)
    }

    /// 恢复会话时从已有订单数之后继续编号
    pub fn resume_from(session_id: &str, existing_orders: u64) -> Self {
        Self {
            session_id: session_id.to_string(),
            sequence: AtomicU64::new(existing_orders + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id("BTC/USD");
        assert!(id.starts_with("grid-btcusd-"));
    }

    #[test]
    fn test_order_ids_unique_and_sequential() {
        let generator = OrderIdGenerator::new("grid-btcusd-1700000000000");
        let first = generator.next(4);
        let second = generator.next(4);
        assert_ne!(first, second);
        assert!(first.ends_with("-L4-1"));
        assert!(second.ends_with("-L4-2"));
    }

    #[test]
    fn test_resume_continues_sequence() {
        let generator = OrderIdGenerator::resume_from("grid-btcusd-1700000000000", 7);
        assert!(generator.next(2).ends_with("-L2-8"));
    }
}
