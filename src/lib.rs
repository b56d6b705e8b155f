#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]

pub mod core;
pub mod engine;
pub mod exchanges;
pub mod journal;
pub mod persist;
pub mod utils;

// 选择性导出，避免命名冲突
pub use core::{config::*, error::*, gateway::*, retry_policy::*, types::*};
// 事件日志只导出对外类型，载荷结构走完整路径
pub use journal::{Event, EventJournal, EventKind};
pub use engine::*;
pub use exchanges::*;
pub use utils::*;
