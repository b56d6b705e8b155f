// 工具模块 - 通用工具函数
pub mod order_id;
pub mod signature;

pub use order_id::{generate_session_id, OrderIdGenerator};
pub use signature::SignatureHelper;
