use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("网络请求错误: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("YAML配置错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("环境变量错误: {0}")]
    EnvError(#[from] dotenv::Error),

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("API错误: {code} - {message}")]
    ApiError { code: i32, message: String },

    #[error("认证错误: {0}")]
    AuthError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("参数验证错误: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("订单错误: {0}")]
    OrderError(String),

    #[error("订单未找到: ID {order_id} (交易对: {pair})")]
    OrderNotFound { order_id: String, pair: String },

    #[error("余额不足: 需要 {required}, 可用 {available}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("速率限制: {0}")]
    RateLimitError(String, Option<u64>),

    #[error("超时错误: 操作 '{operation}' 超时 ({timeout_seconds}秒)")]
    TimeoutError {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("风控拒绝: {0}")]
    RiskViolation(String),

    #[error("对账不一致: {0}")]
    ReconciliationMismatch(String),

    #[error("持久化错误: {0}")]
    PersistenceError(String),

    #[error("事件日志错误: {0}")]
    JournalError(String),

    #[error("不支持的交易所: {0}")]
    UnsupportedExchange(String),

    #[error("其他错误: {0}")]
    Other(String),
}

impl GridError {
    /// 判断错误是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            GridError::NetworkError(_) => true,
            GridError::TimeoutError { .. } => true,
            GridError::RateLimitError(_, _) => true,
            GridError::ApiError { code, .. } => {
                // HTTP 5xx 错误通常可以重试
                *code >= 500 && *code < 600
            }
            _ => false,
        }
    }

    /// 获取建议的重试等待时间(秒)
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GridError::RateLimitError(_, retry_after) => *retry_after,
            GridError::NetworkError(_) => Some(1),
            GridError::TimeoutError { .. } => Some(2),
            GridError::ApiError { code, .. } if *code >= 500 => Some(5),
            _ => None,
        }
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            GridError::NetworkError(_) => ErrorSeverity::Warning,
            GridError::TimeoutError { .. } => ErrorSeverity::Warning,
            GridError::RateLimitError(_, _) => ErrorSeverity::Warning,
            GridError::RiskViolation(_) => ErrorSeverity::Warning,
            GridError::ReconciliationMismatch(_) => ErrorSeverity::Warning,
            GridError::PersistenceError(_) => ErrorSeverity::Warning,
            GridError::ValidationError { .. } => ErrorSeverity::Error,
            GridError::AuthError(_) => ErrorSeverity::Critical,
            GridError::ConfigError(_) => ErrorSeverity::Critical,
            GridError::JournalError(_) => ErrorSeverity::Critical,
            GridError::UnsupportedExchange(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// 获取用户友好的错误描述
    pub fn user_friendly_message(&self) -> String {
        match self {
            GridError::NetworkError(_) => "网络连接问题，请检查网络状态".to_string(),
            GridError::AuthError(_) => "API认证失败，请检查密钥配置".to_string(),
            GridError::RateLimitError(_, retry_after) => {
                if let Some(seconds) = retry_after {
                    format!("请求过于频繁，请等待{}秒后重试", seconds)
                } else {
                    "请求过于频繁，请稍后重试".to_string()
                }
            }
            GridError::InsufficientBalance {
                required,
                available,
            } => {
                format!("余额不足，需要{:.8}，可用{:.8}", required, available)
            }
            GridError::OrderNotFound { order_id, .. } => {
                format!("订单{}不存在或已过期", order_id)
            }
            GridError::RiskViolation(reason) => {
                format!("下单被风控拦截：{}", reason)
            }
            GridError::PersistenceError(_) => {
                "远端存储暂不可用，交易不受影响".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Info,     // 信息性错误，通常不影响操作
    Warning,  // 警告性错误，可能影响性能但可以重试
    Error,    // 一般错误，需要用户处理
    Critical, // 严重错误，需要立即处理
}
