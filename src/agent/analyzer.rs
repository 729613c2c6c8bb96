//! Rebalance decision logic

use crate::config::{Network, StrategyConfig};
use crate::model::{NetworkYieldSample, RebalanceDecision};
use crate::services::{with_timeout, ProfitabilityQuoter, QuoteRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Turns a cycle's samples and the current allocation into one decision
pub struct ProfitabilityAnalyzer {
    quoter: Arc<dyn ProfitabilityQuoter>,
    strategy: StrategyConfig,
    timeout: Duration,
}

/// Highest APR first; ties by higher TVL, then by network name
pub fn rank(samples: &[NetworkYieldSample]) -> Vec<&NetworkYieldSample> {
    let mut ranked: Vec<_> = samples.iter().collect();
    ranked.sort_by(|a, b| {
        b.apr
            .total_cmp(&a.apr)
            .then_with(|| b.tvl.total_cmp(&a.tvl))
            .then_with(|| a.network.name().cmp(b.network.name()))
    });
    ranked
}

impl ProfitabilityAnalyzer {
    pub fn new(
        quoter: Arc<dyn ProfitabilityQuoter>,
        strategy: StrategyConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            quoter,
            strategy,
            timeout,
        }
    }

    /// Decide whether to move capital out of `allocation` this cycle.
    ///
    /// `allocation` is the network currently holding the capital and the
    /// amount held there. A quoter error counts as "not profitable".
    pub async fn analyze(
        &self,
        samples: &[NetworkYieldSample],
        allocation: Option<(Network, f64)>,
    ) -> RebalanceDecision {
        let ranked = rank(samples);
        let Some(best) = ranked.first().copied() else {
            return RebalanceDecision::rejected("no yield samples");
        };
        let Some((current_network, holding)) = allocation else {
            return RebalanceDecision::rejected("no capital allocated");
        };
        let Some(current) = samples.iter().find(|s| s.network == current_network) else {
            return RebalanceDecision::rejected(format!(
                "current network {} has no yield sample",
                current_network
            ));
        };

        let delta = best.apr - current.apr;
        let mut decision = RebalanceDecision {
            approved: false,
            source_network: Some(current.network),
            target_network: Some(best.network),
            amount: self.strategy.max_rebalance_amount.min(holding),
            source_apr: current.apr,
            target_apr: best.apr,
            expected_apr_gain: delta,
            reason: String::new(),
        };

        debug!(
            best = %best.network,
            best_apr = best.apr,
            current = %current.network,
            current_apr = current.apr,
            delta,
            "Ranked yields"
        );

        if delta < self.strategy.min_apr_delta {
            decision.reason = format!(
                "APR delta too small: {:.2}% < {:.2}%",
                delta, self.strategy.min_apr_delta
            );
            return decision;
        }
        if best.network == current.network {
            decision.reason = format!("already allocated to best network {}", best.network);
            return decision;
        }

        let request = QuoteRequest {
            source_network: current.network,
            target_network: best.network,
            asset: self.strategy.asset.clone(),
            amount: decision.amount,
            expected_apr_gain: delta,
            min_profit_percent: self.strategy.min_profit_percent,
        };
        let quote = match with_timeout("quote", self.timeout, self.quoter.quote(&request)).await {
            Ok(quote) => quote,
            Err(e) => {
                warn!(error = %e, "Profitability quote failed, treating as unprofitable");
                decision.reason = format!("not profitable after costs (quote failed: {})", e);
                return decision;
            }
        };

        if !quote.profitable {
            info!(
                estimated_cost = quote.estimated_cost,
                estimated_profit = quote.estimated_profit,
                "Move rejected by quoter"
            );
            decision.reason = "not profitable after costs".to_string();
            return decision;
        }

        decision.approved = true;
        decision.reason = format!(
            "APR improvement {:.2}% ({} {:.2}% -> {} {:.2}%), estimated profit {:.2} after {:.2} costs",
            delta,
            current.network,
            current.apr,
            best.network,
            best.apr,
            quote.estimated_profit,
            quote.estimated_cost
        );
        decision
    }
}
