//! Collaborator interfaces consumed by the agent
//!
//! The agent only talks to the outside world through these traits, so live
//! integrations and deterministic fakes are interchangeable:
//! - [`YieldOracle`]: per-network APR/TVL and asset prices
//! - [`ProfitabilityQuoter`]: whether a cross-network move pays for itself
//!
//! Custody and persistence have their own modules.

mod cost_model;
mod http_oracle;
mod paper;

pub use cost_model::CostModelQuoter;
pub use http_oracle::{price_feed_id, HttpOracle};
pub use paper::PaperOracle;

use crate::config::Network;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Raw oracle reading for one network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldQuote {
    pub apr: f64,
    pub tvl: f64,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait YieldOracle: Send + Sync {
    /// Current yield for a network; may fail per call
    async fn get_yield(&self, network: Network) -> Result<YieldQuote>;

    /// USD price of an asset symbol (e.g. "ETH")
    async fn get_price(&self, asset: &str) -> Result<f64>;
}

/// Candidate move submitted for a profitability check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub source_network: Network,
    pub target_network: Network,
    pub asset: String,
    pub amount: f64,
    /// APR improvement in percentage points the move is expected to earn
    pub expected_apr_gain: f64,
    /// Minimum net profit after costs, percent of `amount`
    pub min_profit_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub profitable: bool,
    pub estimated_cost: f64,
    pub estimated_profit: f64,
}

#[async_trait]
pub trait ProfitabilityQuoter: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> Result<Quote>;
}

/// Bound a collaborator call; an expired call becomes [`Error::Timeout`]
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
