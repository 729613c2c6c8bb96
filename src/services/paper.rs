//! Paper oracle
//!
//! Serves yields and prices from a fixed table so the agent can run without
//! any live data source. [`PaperOracle::set_yield`] changes a figure at
//! runtime.

use super::{YieldOracle, YieldQuote};
use crate::config::{Network, OracleConfig, PaperYield};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct PaperOracle {
    yields: Arc<RwLock<BTreeMap<Network, PaperYield>>>,
    prices: Arc<RwLock<HashMap<String, f64>>>,
}

impl PaperOracle {
    pub fn new(yields: BTreeMap<Network, PaperYield>, prices: HashMap<String, f64>) -> Self {
        let prices = prices
            .into_iter()
            .map(|(asset, price)| (asset.to_uppercase(), price))
            .collect();
        Self {
            yields: Arc::new(RwLock::new(yields)),
            prices: Arc::new(RwLock::new(prices)),
        }
    }

    pub fn from_config(config: &OracleConfig) -> Self {
        Self::new(config.paper_yields.clone(), config.paper_prices.clone())
    }

    /// Set or replace the yield served for a network
    pub async fn set_yield(&self, network: Network, apr: f64, tvl: f64) {
        self.yields
            .write()
            .await
            .insert(network, PaperYield { apr, tvl });
    }

    /// Stop serving a network; later lookups fail
    pub async fn remove_yield(&self, network: Network) {
        self.yields.write().await.remove(&network);
    }

    pub async fn set_price(&self, asset: &str, price: f64) {
        self.prices.write().await.insert(asset.to_uppercase(), price);
    }
}

#[async_trait]
impl YieldOracle for PaperOracle {
    async fn get_yield(&self, network: Network) -> Result<YieldQuote> {
        let yields = self.yields.read().await;
        let entry = yields
            .get(&network)
            .ok_or_else(|| Error::Oracle(format!("no paper yield for {}", network)))?;
        Ok(YieldQuote {
            apr: entry.apr,
            tvl: entry.tvl,
            timestamp: Utc::now(),
        })
    }

    async fn get_price(&self, asset: &str) -> Result<f64> {
        self.prices
            .read()
            .await
            .get(&asset.to_uppercase())
            .copied()
            .ok_or_else(|| Error::Oracle(format!("no paper price for {}", asset)))
    }
}
