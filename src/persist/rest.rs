//! REST 持久化实现
//! 把会话/订单/成交/持仓按JSON POST到配置端点，服务端按id幂等覆写

use super::{FillRecord, OrderRecord, PersistenceSink, PositionRecord, SessionRecord};
use crate::core::config::PersistenceParams;
use crate::core::error::GridError;
use crate::core::types::Result;
use async_trait::async_trait;
use serde::Serialize;

pub struct RestSink {
    base_url: String,
    client: reqwest::Client,
}

impl RestSink {
    pub fn new(params: &PersistenceParams) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("RustGrid/0.1.0")
            .timeout(std::time::Duration::from_secs(params.timeout_secs))
            .build()
            .expect("创建HTTP客户端失败");

        Self {
            base_url: params.base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn post<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self.client.post(&url).json(body).send().await?;

        if !response.status().is_success() {
            return Err(GridError::PersistenceError(format!(
                "{} 返回 {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for RestSink {
    fn name(&self) -> &str {
        "rest"
    }

    async fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        self.post("sessions", record).await
    }

    async fn upsert_order(&self, record: &OrderRecord) -> Result<()> {
        self.post("orders", record).await
    }

    async fn upsert_fill(&self, record: &FillRecord) -> Result<()> {
        self.post("fills", record).await
    }

    async fn upsert_position(&self, record: &PositionRecord) -> Result<()> {
        self.post("positions", record).await
    }
}
