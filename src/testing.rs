//! Deterministic collaborator fakes for unit tests

use crate::config::Network;
use crate::custody::Custody;
use crate::model::{
    AgentPerformanceAggregate, AgentWallet, GrantFrequency, NetworkYieldSample, RebalanceRecord,
    StatusUpdate, TimeWindow,
};
use crate::services::{ProfitabilityQuoter, Quote, QuoteRequest, YieldOracle, YieldQuote};
use crate::store::{CycleLease, MemoryStore, Store};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct FakeOracle {
    pub yields: Mutex<HashMap<Network, (f64, f64)>>,
    pub failing: Mutex<HashSet<Network>>,
    pub stalled: Mutex<HashSet<Network>>,
}

impl FakeOracle {
    pub fn with_yields(yields: &[(Network, f64, f64)]) -> Self {
        let oracle = Self::default();
        oracle.set_yields(yields);
        oracle
    }

    pub fn set_yields(&self, yields: &[(Network, f64, f64)]) {
        let mut map = self.yields.lock().unwrap();
        map.clear();
        for (network, apr, tvl) in yields {
            map.insert(*network, (*apr, *tvl));
        }
    }

    pub fn fail(&self, network: Network) {
        self.failing.lock().unwrap().insert(network);
    }

    pub fn stall(&self, network: Network) {
        self.stalled.lock().unwrap().insert(network);
    }
}

#[async_trait]
impl YieldOracle for FakeOracle {
    async fn get_yield(&self, network: Network) -> Result<YieldQuote> {
        if self.stalled.lock().unwrap().contains(&network) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing.lock().unwrap().contains(&network) {
            return Err(Error::Oracle(format!("{} unavailable", network)));
        }
        let (apr, tvl) = self
            .yields
            .lock()
            .unwrap()
            .get(&network)
            .copied()
            .ok_or_else(|| Error::Oracle(format!("no yield for {}", network)))?;
        Ok(YieldQuote {
            apr,
            tvl,
            timestamp: Utc::now(),
        })
    }

    async fn get_price(&self, _asset: &str) -> Result<f64> {
        Ok(1.0)
    }
}

pub enum QuoteBehavior {
    Profitable,
    Unprofitable,
    Error,
}

pub struct FakeQuoter {
    pub behavior: Mutex<QuoteBehavior>,
    pub requests: Mutex<Vec<QuoteRequest>>,
}

impl FakeQuoter {
    pub fn new(behavior: QuoteBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ProfitabilityQuoter for FakeQuoter {
    async fn quote(&self, request: &QuoteRequest) -> Result<Quote> {
        self.requests.lock().unwrap().push(request.clone());
        match *self.behavior.lock().unwrap() {
            QuoteBehavior::Profitable => Ok(Quote {
                profitable: true,
                estimated_cost: 1.0,
                estimated_profit: 10.0,
            }),
            QuoteBehavior::Unprofitable => Ok(Quote {
                profitable: false,
                estimated_cost: 50.0,
                estimated_profit: -5.0,
            }),
            QuoteBehavior::Error => Err(Error::Quote("router offline".to_string())),
        }
    }
}

pub struct FakeCustody {
    pub authorized: AtomicBool,
    pub fail_invoke: AtomicBool,
    pub invoke_delay: Mutex<Duration>,
    pub invocations: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub wallets_created: AtomicUsize,
    pub grants: Mutex<Vec<(String, String, f64, GrantFrequency)>>,
    pub spent: Mutex<f64>,
}

impl FakeCustody {
    pub fn new(authorized: bool) -> Self {
        Self {
            authorized: AtomicBool::new(authorized),
            fail_invoke: AtomicBool::new(false),
            invoke_delay: Mutex::new(Duration::ZERO),
            invocations: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            wallets_created: AtomicUsize::new(0),
            grants: Mutex::new(Vec::new()),
            spent: Mutex::new(0.0),
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Custody for FakeCustody {
    async fn create_wallet(&self, agent_id: &str, network: Network) -> Result<AgentWallet> {
        let n = self.wallets_created.fetch_add(1, Ordering::SeqCst);
        Ok(AgentWallet {
            agent_id: agent_id.to_string(),
            address: format!("0x{:040x}", n + 1),
            network,
            network_id: network.chain_id(),
        })
    }

    async fn invoke(
        &self,
        _wallet: &AgentWallet,
        _contract_address: &str,
        _method: &str,
        _args: Vec<Value>,
    ) -> Result<String> {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.invoke_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_invoke.load(Ordering::SeqCst) {
            return Err(Error::Custody("bridge reverted".to_string()));
        }
        Ok(format!("0x{:064x}", n + 1))
    }

    async fn grant_authorization(
        &self,
        grantor: &str,
        agent_id: &str,
        amount_ceiling: f64,
        frequency: GrantFrequency,
    ) -> Result<String> {
        let mut grants = self.grants.lock().unwrap();
        grants.push((
            grantor.to_string(),
            agent_id.to_string(),
            amount_ceiling,
            frequency,
        ));
        Ok(format!("auth-{}", grants.len()))
    }

    async fn check_authorization(&self, _agent_id: &str, _amount: f64) -> Result<bool> {
        Ok(self.authorized.load(Ordering::SeqCst))
    }

    async fn record_spend(&self, _agent_id: &str, amount: f64) -> Result<()> {
        *self.spent.lock().unwrap() += amount;
        Ok(())
    }
}

/// Memory store whose writes can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_insert_rebalance: AtomicBool,
    pub fail_update_status: AtomicBool,
    pub fail_snapshots: AtomicBool,
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_snapshot(&self, sample: &NetworkYieldSample) -> Result<()> {
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(Error::Persistence("snapshot table unavailable".to_string()));
        }
        self.inner.insert_snapshot(sample).await
    }

    async fn insert_rebalance(&self, record: &RebalanceRecord) -> Result<()> {
        if self.fail_insert_rebalance.load(Ordering::SeqCst) {
            return Err(Error::Persistence("rebalance table unavailable".to_string()));
        }
        self.inner.insert_rebalance(record).await
    }

    async fn update_status(
        &self,
        transaction_ref: &str,
        update: StatusUpdate,
    ) -> Result<RebalanceRecord> {
        if self.fail_update_status.load(Ordering::SeqCst) {
            return Err(Error::Persistence("rebalance table unavailable".to_string()));
        }
        self.inner.update_status(transaction_ref, update).await
    }

    async fn upsert_aggregate(&self, aggregate: &AgentPerformanceAggregate) -> Result<()> {
        self.inner.upsert_aggregate(aggregate).await
    }

    async fn get_aggregate(&self, agent_id: &str) -> Result<Option<AgentPerformanceAggregate>> {
        self.inner.get_aggregate(agent_id).await
    }

    async fn aggregates(&self) -> Result<Vec<AgentPerformanceAggregate>> {
        self.inner.aggregates().await
    }

    async fn insert_performance(&self, aggregate: &AgentPerformanceAggregate) -> Result<()> {
        self.inner.insert_performance(aggregate).await
    }

    async fn performance_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentPerformanceAggregate>> {
        self.inner.performance_history(agent_id, limit).await
    }

    async fn get_rebalance(&self, transaction_ref: &str) -> Result<Option<RebalanceRecord>> {
        self.inner.get_rebalance(transaction_ref).await
    }

    async fn all_rebalances(&self, window: TimeWindow) -> Result<Vec<RebalanceRecord>> {
        self.inner.all_rebalances(window).await
    }

    async fn rebalances(
        &self,
        agent_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<RebalanceRecord>> {
        self.inner.rebalances(agent_id, window).await
    }

    async fn snapshots(
        &self,
        network: Option<Network>,
        window: TimeWindow,
    ) -> Result<Vec<NetworkYieldSample>> {
        self.inner.snapshots(network, window).await
    }

    async fn acquire_cycle_lease(&self, lease: &CycleLease) -> Result<bool> {
        self.inner.acquire_cycle_lease(lease).await
    }

    async fn release_cycle_lease(&self, agent_id: &str, owner: &str) -> Result<()> {
        self.inner.release_cycle_lease(agent_id, owner).await
    }
}

pub fn sample(network: Network, apr: f64, tvl: f64) -> NetworkYieldSample {
    NetworkYieldSample {
        network,
        network_id: network.chain_id(),
        apr,
        tvl,
        timestamp: Utc::now(),
    }
}
