//! Persistent store
//!
//! Snapshots, rebalance records and performance rows are append-only
//! history; the only things mutated in place are a rebalance record's single
//! terminal transition, the per-agent performance aggregate and the cycle
//! lease that keeps one agent's cycles from overlapping across processes.

mod jsonl;
mod memory;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

use crate::config::Network;
use crate::model::{
    AgentPerformanceAggregate, NetworkYieldSample, RebalanceRecord, StatusUpdate, TimeWindow,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Exclusive right to run cycles for one agent until `expires_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleLease {
    pub agent_id: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl CycleLease {
    /// Whether `owner` may take over this lease at `now`
    pub fn yields_to(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner == owner || self.expires_at <= now
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_snapshot(&self, sample: &NetworkYieldSample) -> Result<()>;

    /// Append a rebalance record; its transaction ref must be new
    async fn insert_rebalance(&self, record: &RebalanceRecord) -> Result<()>;

    /// Move a pending record to its terminal status and return the result
    async fn update_status(
        &self,
        transaction_ref: &str,
        update: StatusUpdate,
    ) -> Result<RebalanceRecord>;

    /// Insert or replace the aggregate for `aggregate.agent_id`
    async fn upsert_aggregate(&self, aggregate: &AgentPerformanceAggregate) -> Result<()>;

    async fn get_aggregate(&self, agent_id: &str) -> Result<Option<AgentPerformanceAggregate>>;

    /// Current aggregate of every agent, ordered by agent id
    async fn aggregates(&self) -> Result<Vec<AgentPerformanceAggregate>>;

    /// Append a row to the agent's performance time series
    async fn insert_performance(&self, aggregate: &AgentPerformanceAggregate) -> Result<()>;

    /// Latest performance rows for an agent, newest first
    async fn performance_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentPerformanceAggregate>>;

    async fn get_rebalance(&self, transaction_ref: &str) -> Result<Option<RebalanceRecord>>;

    /// Records for an agent initiated inside the window, oldest first
    async fn rebalances(&self, agent_id: &str, window: TimeWindow)
        -> Result<Vec<RebalanceRecord>>;

    /// Records of every agent initiated inside the window, oldest first
    async fn all_rebalances(&self, window: TimeWindow) -> Result<Vec<RebalanceRecord>>;

    /// Snapshots inside the window, optionally for one network, oldest first
    async fn snapshots(
        &self,
        network: Option<Network>,
        window: TimeWindow,
    ) -> Result<Vec<NetworkYieldSample>>;

    /// Take or renew the cycle lease. `false` while another owner holds an
    /// unexpired lease for the same agent.
    async fn acquire_cycle_lease(&self, lease: &CycleLease) -> Result<bool>;

    /// Drop the lease if `owner` still holds it
    async fn release_cycle_lease(&self, agent_id: &str, owner: &str) -> Result<()>;
}

/// In-memory tables shared by the store implementations
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    snapshots: Vec<NetworkYieldSample>,
    rebalances: Vec<RebalanceRecord>,
    by_ref: HashMap<String, usize>,
    aggregates: HashMap<String, AgentPerformanceAggregate>,
    performance: Vec<AgentPerformanceAggregate>,
    leases: HashMap<String, CycleLease>,
}

impl StoreState {
    pub(crate) fn insert_snapshot(&mut self, sample: NetworkYieldSample) {
        self.snapshots.push(sample);
    }

    pub(crate) fn check_new_ref(&self, transaction_ref: &str) -> Result<()> {
        if self.by_ref.contains_key(transaction_ref) {
            return Err(Error::Persistence(format!(
                "duplicate transaction ref {}",
                transaction_ref
            )));
        }
        Ok(())
    }

    pub(crate) fn insert_rebalance(&mut self, record: RebalanceRecord) -> Result<()> {
        self.check_new_ref(&record.transaction_ref)?;
        self.by_ref
            .insert(record.transaction_ref.clone(), self.rebalances.len());
        self.rebalances.push(record);
        Ok(())
    }

    /// Apply the update to a copy without touching the stored record
    pub(crate) fn preview_update(
        &self,
        transaction_ref: &str,
        update: &StatusUpdate,
    ) -> Result<RebalanceRecord> {
        let index = self
            .by_ref
            .get(transaction_ref)
            .ok_or_else(|| Error::NotFound(format!("rebalance {}", transaction_ref)))?;
        let mut record = self.rebalances[*index].clone();
        record.apply(update.clone())?;
        Ok(record)
    }

    pub(crate) fn update_status(
        &mut self,
        transaction_ref: &str,
        update: StatusUpdate,
    ) -> Result<RebalanceRecord> {
        let updated = self.preview_update(transaction_ref, &update)?;
        if let Some(index) = self.by_ref.get(transaction_ref) {
            self.rebalances[*index] = updated.clone();
        }
        Ok(updated)
    }

    pub(crate) fn upsert_aggregate(&mut self, aggregate: AgentPerformanceAggregate) {
        self.aggregates.insert(aggregate.agent_id.clone(), aggregate);
    }

    pub(crate) fn aggregates(&self) -> Vec<AgentPerformanceAggregate> {
        let mut all: Vec<_> = self.aggregates.values().cloned().collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    pub(crate) fn insert_performance(&mut self, row: AgentPerformanceAggregate) {
        self.performance.push(row);
    }

    pub(crate) fn performance_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Vec<AgentPerformanceAggregate> {
        self.performance
            .iter()
            .rev()
            .filter(|row| row.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn all_rebalances(&self, window: TimeWindow) -> Vec<RebalanceRecord> {
        self.rebalances
            .iter()
            .filter(|r| window.contains(r.initiated_at))
            .cloned()
            .collect()
    }

    pub(crate) fn acquire_lease(&mut self, lease: &CycleLease, now: DateTime<Utc>) -> bool {
        if let Some(held) = self.leases.get(&lease.agent_id) {
            if !held.yields_to(&lease.owner, now) {
                return false;
            }
        }
        self.leases.insert(lease.agent_id.clone(), lease.clone());
        true
    }

    pub(crate) fn release_lease(&mut self, agent_id: &str, owner: &str) {
        if self.leases.get(agent_id).is_some_and(|held| held.owner == owner) {
            self.leases.remove(agent_id);
        }
    }

    pub(crate) fn get_aggregate(&self, agent_id: &str) -> Option<AgentPerformanceAggregate> {
        self.aggregates.get(agent_id).cloned()
    }

    pub(crate) fn get_rebalance(&self, transaction_ref: &str) -> Option<RebalanceRecord> {
        self.by_ref
            .get(transaction_ref)
            .map(|index| self.rebalances[*index].clone())
    }

    pub(crate) fn rebalances(&self, agent_id: &str, window: TimeWindow) -> Vec<RebalanceRecord> {
        self.rebalances
            .iter()
            .filter(|r| r.agent_id == agent_id && window.contains(r.initiated_at))
            .cloned()
            .collect()
    }

    pub(crate) fn snapshots(
        &self,
        network: Option<Network>,
        window: TimeWindow,
    ) -> Vec<NetworkYieldSample> {
        self.snapshots
            .iter()
            .filter(|s| network.map_or(true, |n| s.network == n) && window.contains(s.timestamp))
            .cloned()
            .collect()
    }
}
