//! Cost-model profitability quoter
//!
//! A move is worth making when the APR gain earns back gas and bridge fees
//! quickly enough and still leaves the requested minimum profit.

use super::{ProfitabilityQuoter, Quote, QuoteRequest, YieldOracle};
use crate::config::{CostModelConfig, NetworkCost};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

const DAYS_PER_YEAR: f64 = 365.0;

pub struct CostModelQuoter {
    config: CostModelConfig,
    oracle: Arc<dyn YieldOracle>,
}

impl CostModelQuoter {
    pub fn new(config: CostModelConfig, oracle: Arc<dyn YieldOracle>) -> Self {
        Self { config, oracle }
    }

    /// Price a native asset, falling back to the configured price
    async fn native_price(&self, asset: &str) -> f64 {
        match self.oracle.get_price(asset).await {
            Ok(price) if price > 0.0 => price,
            Ok(price) => {
                tracing::warn!(asset, price, "Non-positive native price, using fallback");
                self.config.fallback_native_price
            }
            Err(e) => {
                tracing::warn!(asset, error = %e, "Could not price native asset, using fallback");
                self.config.fallback_native_price
            }
        }
    }

    /// Gas on the source network plus the bridge fee, in USD
    async fn estimate_cost(&self, request: &QuoteRequest) -> f64 {
        let default_cost = NetworkCost {
            native_asset: "ETH".to_string(),
            gas_native: 0.001,
        };
        let source = self
            .config
            .networks
            .get(&request.source_network)
            .unwrap_or(&default_cost);

        let native_price = self.native_price(&source.native_asset).await;
        let eth_price = if source.native_asset.eq_ignore_ascii_case("ETH") {
            native_price
        } else {
            self.native_price("ETH").await
        };

        source.gas_native * native_price + self.config.bridge_fee_eth * eth_price
    }
}

#[async_trait]
impl ProfitabilityQuoter for CostModelQuoter {
    async fn quote(&self, request: &QuoteRequest) -> Result<Quote> {
        let estimated_cost = self.estimate_cost(request).await;

        let annual_gain = request.amount * request.expected_apr_gain / 100.0;
        let daily_gain = annual_gain / DAYS_PER_YEAR;
        let break_even_days = if daily_gain > 0.0 {
            estimated_cost / daily_gain
        } else {
            f64::INFINITY
        };

        let estimated_profit =
            annual_gain * self.config.profit_horizon_days / DAYS_PER_YEAR - estimated_cost;
        let profit_percent = if request.amount > 0.0 {
            estimated_profit / request.amount * 100.0
        } else {
            0.0
        };

        let profitable = request.amount > 0.0
            && break_even_days < self.config.max_break_even_days
            && profit_percent >= request.min_profit_percent;

        tracing::debug!(
            source = %request.source_network,
            target = %request.target_network,
            amount = request.amount,
            estimated_cost,
            estimated_profit,
            break_even_days,
            profitable,
            "Cost model quote"
        );

        Ok(Quote {
            profitable,
            estimated_cost,
            estimated_profit,
        })
    }
}
