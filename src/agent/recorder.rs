//! Snapshot history and the per-agent aggregate

use super::executor::ExecutionOutcome;
use crate::config::Network;
use crate::model::{AgentPerformanceAggregate, AgentStatus, NetworkYieldSample, TimeWindow};
use crate::store::Store;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

pub struct PerformanceRecorder {
    agent_id: String,
    store: Arc<dyn Store>,
    initial_allocation: BTreeMap<Network, f64>,
}

impl PerformanceRecorder {
    pub fn new(
        agent_id: impl Into<String>,
        store: Arc<dyn Store>,
        initial_allocation: BTreeMap<Network, f64>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            store,
            initial_allocation,
        }
    }

    /// Persist every sample of the cycle. Returns how many were stored.
    ///
    /// Snapshot history is best effort: a failed write is logged and the
    /// cycle carries on.
    pub async fn record_snapshots(&self, samples: &[NetworkYieldSample]) -> usize {
        let mut stored = 0;
        for sample in samples {
            match self.store.insert_snapshot(sample).await {
                Ok(()) => stored += 1,
                Err(e) => error!(
                    network = %sample.network,
                    error = %e,
                    "Failed to persist yield snapshot"
                ),
            }
        }
        debug!(stored, total = samples.len(), "Recorded yield snapshots");
        stored
    }

    /// Stored aggregate, or a fresh one seeded from the initial allocation
    pub async fn load_aggregate(&self) -> Result<AgentPerformanceAggregate> {
        Ok(match self.store.get_aggregate(&self.agent_id).await? {
            Some(aggregate) => aggregate,
            None => AgentPerformanceAggregate::new(&self.agent_id, self.initial_allocation.clone()),
        })
    }

    /// Fold a cycle into the aggregate and upsert it
    pub async fn update_aggregate(
        &self,
        mut aggregate: AgentPerformanceAggregate,
        outcome: Option<&ExecutionOutcome>,
        samples: &[NetworkYieldSample],
        status: AgentStatus,
    ) -> Result<AgentPerformanceAggregate> {
        if let Some(outcome) = outcome.filter(|o| o.confirmed()) {
            let record = &outcome.record;
            aggregate.move_capital(record.source_network, record.target_network, record.amount);
        }

        let records = self
            .store
            .rebalances(&self.agent_id, TimeWindow::all())
            .await?;
        aggregate.recompute(&records, samples);
        aggregate.status = status;

        self.store.upsert_aggregate(&aggregate).await?;
        if let Err(e) = self.store.insert_performance(&aggregate).await {
            error!(error = %e, "Failed to append performance row");
        }
        debug!(
            total_value_managed = aggregate.total_value_managed,
            current_apr = aggregate.current_apr,
            total_rebalances = aggregate.total_rebalances,
            "Updated agent aggregate"
        );
        Ok(aggregate)
    }

    /// Latest performance rows, newest first
    pub async fn performance_history(&self, limit: usize) -> Result<Vec<AgentPerformanceAggregate>> {
        self.store.performance_history(&self.agent_id, limit).await
    }

    /// Change only the lifecycle status
    pub async fn set_status(&self, status: AgentStatus) -> Result<AgentPerformanceAggregate> {
        let mut aggregate = self.load_aggregate().await?;
        aggregate.status = status;
        aggregate.updated_at = chrono::Utc::now();
        self.store.upsert_aggregate(&aggregate).await?;
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample, FlakyStore};
    use std::sync::atomic::Ordering;

    fn recorder(store: Arc<FlakyStore>) -> PerformanceRecorder {
        PerformanceRecorder::new(
            "agent-1",
            store,
            BTreeMap::from([(Network::Base, 600.0), (Network::Celo, 400.0)]),
        )
    }

    #[tokio::test]
    async fn test_snapshot_failures_are_tolerated() {
        let store = Arc::new(FlakyStore::default());
        let recorder = recorder(store.clone());
        let samples = vec![sample(Network::Base, 4.0, 1.0), sample(Network::Celo, 6.0, 1.0)];

        assert_eq!(recorder.record_snapshots(&samples).await, 2);
        store.fail_snapshots.store(true, Ordering::SeqCst);
        assert_eq!(recorder.record_snapshots(&samples).await, 0);
    }

    #[tokio::test]
    async fn test_aggregate_seeded_and_weighted() {
        let store = Arc::new(FlakyStore::default());
        let recorder = recorder(store.clone());

        let aggregate = recorder.load_aggregate().await.unwrap();
        assert_eq!(aggregate.total_value_managed, 1_000.0);
        assert_eq!(aggregate.status, AgentStatus::Idle);

        let samples = vec![sample(Network::Base, 4.0, 1.0), sample(Network::Celo, 6.0, 1.0)];
        let aggregate = recorder
            .update_aggregate(aggregate, None, &samples, AgentStatus::Active)
            .await
            .unwrap();
        assert!((aggregate.current_apr - 4.8).abs() < 1e-9);
        assert_eq!(aggregate.total_rebalances, 0);

        let stored = store.get_aggregate("agent-1").await.unwrap().unwrap();
        assert_eq!(stored, aggregate);
    }

    #[tokio::test]
    async fn test_each_update_appends_a_performance_row() {
        let store = Arc::new(FlakyStore::default());
        let recorder = recorder(store);

        for apr in [4.0, 5.0, 6.0] {
            let aggregate = recorder.load_aggregate().await.unwrap();
            let samples = vec![sample(Network::Base, apr, 1.0), sample(Network::Celo, apr, 1.0)];
            recorder
                .update_aggregate(aggregate, None, &samples, AgentStatus::Active)
                .await
                .unwrap();
        }
        recorder.set_status(AgentStatus::Stopped).await.unwrap();

        let rows = recorder.performance_history(2).await.unwrap();
        let aprs: Vec<_> = rows.iter().map(|row| row.current_apr).collect();
        assert_eq!(aprs, vec![6.0, 5.0]);
        assert_eq!(recorder.performance_history(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_set_status_keeps_distribution() {
        let store = Arc::new(FlakyStore::default());
        let recorder = recorder(store);
        let aggregate = recorder.set_status(AgentStatus::Stopped).await.unwrap();
        assert_eq!(aggregate.status, AgentStatus::Stopped);
        assert_eq!(aggregate.chain_distribution.len(), 2);
    }
}
