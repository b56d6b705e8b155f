//! 交易对自动选择模块
//!
//! 配置给出候选列表时，按24小时行情给每个候选打分：
//! 日内振幅是网格的利润来源，点差是成本，得分 = 振幅 - 点差惩罚。

use log::{info, warn};

use crate::core::config::GridConfig;
use crate::core::error::GridError;
use crate::core::gateway::ExchangeGateway;
use crate::core::types::{Result, Ticker};

/// 点差在得分里的惩罚倍数
const SPREAD_PENALTY: f64 = 10.0;

/// 单个候选对的评分明细
#[derive(Debug, Clone)]
pub struct PairScore {
    pub pair: String,
    /// 日内振幅与中值之比
    pub volatility: f64,
    /// 买卖价差与中值之比
    pub spread: f64,
    pub score: f64,
}

/// 从一条24小时行情算出评分；数据不完整时返回None
pub fn score_ticker(ticker: &Ticker) -> Option<PairScore> {
    let mid = (ticker.high + ticker.low) / 2.0;
    if mid <= 0.0 || ticker.bid <= 0.0 || ticker.ask < ticker.bid {
        return None;
    }
    let volatility = (ticker.high - ticker.low) / mid;
    let spread = (ticker.ask - ticker.bid) / mid;
    Some(PairScore {
        pair: ticker.pair.clone(),
        volatility,
        spread,
        score: volatility - SPREAD_PENALTY * spread,
    })
}

/// 决定本次会话交易哪个对
/// 单一 trading_pair 直接采用；候选列表则逐个拉行情评分，打印扫描表后取最高分
pub async fn select_pair(config: &GridConfig, gateway: &dyn ExchangeGateway) -> Result<String> {
    if let Some(pair) = config.resolved_pair() {
        return Ok(pair.to_string());
    }
    if config.pair.pairs.is_empty() {
        return Err(GridError::ConfigError(
            "未配置trading_pair，也没有候选pairs".to_string(),
        ));
    }

    let mut scores: Vec<PairScore> = Vec::new();
    for pair in &config.pair.pairs {
        match gateway.get_ticker(pair).await {
            Ok(ticker) => match score_ticker(&ticker) {
                Some(score) => scores.push(score),
                None => warn!("⚠️ 候选对{}行情数据不完整，跳过", pair),
            },
            Err(e) => warn!("⚠️ 获取候选对{}行情失败: {}", pair, e),
        }
    }

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    info!("📊 候选交易对扫描结果:");
    for (i, entry) in scores.iter().enumerate() {
        let prefix = if i + 1 == scores.len() { "└─" } else { "├─" };
        info!(
            "{} {:<12} 振幅 {:.4}  点差 {:.5}  得分 {:.4}",
            prefix, entry.pair, entry.volatility, entry.spread, entry.score
        );
    }

    let best = scores.into_iter().next().ok_or_else(|| {
        GridError::ConfigError("所有候选对都取不到可用行情".to_string())
    })?;
    info!("✅ 已选择交易对: {} (得分 {:.4})", best.pair, best.score);
    Ok(best.pair)
}
