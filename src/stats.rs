//! Fleet-wide statistics derived from stored history
//!
//! Nothing here is stored; every figure is recomputed from the aggregates,
//! snapshots and rebalance records the agents already persist.

use crate::config::Network;
use crate::model::{
    AgentPerformanceAggregate, AgentStatus, NetworkYieldSample, RebalanceRecord, RebalanceStatus,
    TimeWindow,
};
use crate::store::Store;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Totals across every agent in the store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TotalStats {
    pub total_value: f64,
    pub total_rebalances: u64,
    /// Mean of the agents' current APR, two decimals
    pub avg_apr: f64,
    pub active_agents: usize,
    pub total_agents: usize,
}

impl TotalStats {
    pub fn from_aggregates(aggregates: &[AgentPerformanceAggregate]) -> Self {
        if aggregates.is_empty() {
            return Self::default();
        }
        let apr_sum: f64 = aggregates.iter().map(|a| a.current_apr).sum();
        Self {
            total_value: aggregates.iter().map(|a| a.total_value_managed).sum(),
            total_rebalances: aggregates.iter().map(|a| a.total_rebalances).sum(),
            avg_apr: round2(apr_sum / aggregates.len() as f64),
            active_agents: aggregates
                .iter()
                .filter(|a| a.status == AgentStatus::Active)
                .count(),
            total_agents: aggregates.len(),
        }
    }
}

/// Metrics for one network
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainMetrics {
    pub network: Network,
    pub network_id: u64,
    /// Mean sampled APR inside the window
    pub avg_apr: Option<f64>,
    /// TVL of the latest sample inside the window
    pub total_tvl: Option<f64>,
    /// Active agents holding capital on this network
    pub active_agents: usize,
    /// Capital all agents hold on this network
    pub total_value_locked: f64,
    /// Confirmed share of the terminal rebalances into this network
    pub success_rate: Option<f64>,
    /// Mean seconds from initiation to confirmation
    pub avg_rebalance_time_seconds: Option<f64>,
    pub rebalances: usize,
}

impl ChainMetrics {
    pub fn compute(
        network: Network,
        snapshots: &[NetworkYieldSample],
        aggregates: &[AgentPerformanceAggregate],
        records: &[RebalanceRecord],
    ) -> Self {
        let samples: Vec<_> = snapshots.iter().filter(|s| s.network == network).collect();
        let avg_apr = (!samples.is_empty())
            .then(|| round2(samples.iter().map(|s| s.apr).sum::<f64>() / samples.len() as f64));
        let total_tvl = samples.iter().max_by_key(|s| s.timestamp).map(|s| s.tvl);

        let holdings: Vec<_> = aggregates
            .iter()
            .filter_map(|a| {
                a.chain_distribution
                    .get(&network)
                    .filter(|amount| **amount > 0.0)
                    .map(|amount| (a.status, *amount))
            })
            .collect();

        let terminal: Vec<_> = records
            .iter()
            .filter(|r| r.target_network == network && r.status.is_terminal())
            .collect();
        let confirmed: Vec<_> = terminal
            .iter()
            .filter(|r| r.status == RebalanceStatus::Confirmed)
            .collect();
        let success_rate = (!terminal.is_empty())
            .then(|| round2(confirmed.len() as f64 / terminal.len() as f64));
        let durations: Vec<f64> = confirmed
            .iter()
            .filter_map(|r| r.confirmed_at.map(|at| (at - r.initiated_at).num_milliseconds()))
            .map(|ms| ms as f64 / 1_000.0)
            .collect();
        let avg_rebalance_time_seconds = (!durations.is_empty())
            .then(|| round2(durations.iter().sum::<f64>() / durations.len() as f64));

        Self {
            network,
            network_id: network.chain_id(),
            avg_apr,
            total_tvl,
            active_agents: holdings
                .iter()
                .filter(|(status, _)| *status == AgentStatus::Active)
                .count(),
            total_value_locked: holdings.iter().map(|(_, amount)| amount).sum(),
            success_rate,
            avg_rebalance_time_seconds,
            rebalances: terminal.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub generated_at: DateTime<Utc>,
    pub totals: TotalStats,
    pub chains: Vec<ChainMetrics>,
}

impl StatsReport {
    /// Build the report for `networks` from everything in the store
    pub async fn collect(
        store: &dyn Store,
        networks: &[Network],
        window: TimeWindow,
    ) -> Result<Self> {
        let aggregates = store.aggregates().await?;
        let snapshots = store.snapshots(None, window).await?;
        let records = store.all_rebalances(window).await?;

        Ok(Self {
            generated_at: Utc::now(),
            totals: TotalStats::from_aggregates(&aggregates),
            chains: networks
                .iter()
                .map(|network| ChainMetrics::compute(*network, &snapshots, &aggregates, &records))
                .collect(),
        })
    }

    /// Emit one structured log line per network
    pub fn log(&self) {
        info!(
            total_value = self.totals.total_value,
            total_rebalances = self.totals.total_rebalances,
            avg_apr = self.totals.avg_apr,
            active_agents = self.totals.active_agents,
            total_agents = self.totals.total_agents,
            "Fleet totals"
        );
        for chain in &self.chains {
            info!(
                chain = %chain.network,
                chain_id = chain.network_id,
                avg_apr = ?chain.avg_apr,
                total_tvl = ?chain.total_tvl,
                active_agents = chain.active_agents,
                total_value_locked = chain.total_value_locked,
                success_rate = ?chain.success_rate,
                "Chain metrics"
            );
        }
    }
}
