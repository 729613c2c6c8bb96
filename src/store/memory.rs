//! In-memory store, shared safely between concurrently running agents

use super::{CycleLease, Store, StoreState};
use crate::config::Network;
use crate::model::{
    AgentPerformanceAggregate, NetworkYieldSample, RebalanceRecord, StatusUpdate, TimeWindow,
};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_snapshot(&self, sample: &NetworkYieldSample) -> Result<()> {
        self.state.write().await.insert_snapshot(sample.clone());
        Ok(())
    }

    async fn insert_rebalance(&self, record: &RebalanceRecord) -> Result<()> {
        self.state.write().await.insert_rebalance(record.clone())
    }

    async fn update_status(
        &self,
        transaction_ref: &str,
        update: StatusUpdate,
    ) -> Result<RebalanceRecord> {
        self.state
            .write()
            .await
            .update_status(transaction_ref, update)
    }

    async fn upsert_aggregate(&self, aggregate: &AgentPerformanceAggregate) -> Result<()> {
        self.state.write().await.upsert_aggregate(aggregate.clone());
        Ok(())
    }

    async fn get_aggregate(&self, agent_id: &str) -> Result<Option<AgentPerformanceAggregate>> {
        Ok(self.state.read().await.get_aggregate(agent_id))
    }

    async fn aggregates(&self) -> Result<Vec<AgentPerformanceAggregate>> {
        Ok(self.state.read().await.aggregates())
    }

    async fn insert_performance(&self, aggregate: &AgentPerformanceAggregate) -> Result<()> {
        self.state.write().await.insert_performance(aggregate.clone());
        Ok(())
    }

    async fn performance_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentPerformanceAggregate>> {
        Ok(self.state.read().await.performance_history(agent_id, limit))
    }

    async fn get_rebalance(&self, transaction_ref: &str) -> Result<Option<RebalanceRecord>> {
        Ok(self.state.read().await.get_rebalance(transaction_ref))
    }

    async fn all_rebalances(&self, window: TimeWindow) -> Result<Vec<RebalanceRecord>> {
        Ok(self.state.read().await.all_rebalances(window))
    }

    async fn rebalances(
        &self,
        agent_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<RebalanceRecord>> {
        Ok(self.state.read().await.rebalances(agent_id, window))
    }

    async fn snapshots(
        &self,
        network: Option<Network>,
        window: TimeWindow,
    ) -> Result<Vec<NetworkYieldSample>> {
        Ok(self.state.read().await.snapshots(network, window))
    }

    async fn acquire_cycle_lease(&self, lease: &CycleLease) -> Result<bool> {
        Ok(self.state.write().await.acquire_lease(lease, Utc::now()))
    }

    async fn release_cycle_lease(&self, agent_id: &str, owner: &str) -> Result<()> {
        self.state.write().await.release_lease(agent_id, owner);
        Ok(())
    }
}
