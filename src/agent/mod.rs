//! The rebalancing agent
//!
//! One [`Agent`] owns one wallet and runs one cycle at a time:
//!
//! 1. [`YieldCollector`] samples every configured network
//! 2. [`PerformanceRecorder`] stores the snapshots
//! 3. [`ProfitabilityAnalyzer`] decides whether to move capital
//! 4. [`RebalanceExecutor`] carries out an approved decision
//! 5. [`PerformanceRecorder`] folds the result into the aggregate
//!
//! Cycles never overlap. The scheduled loop and [`Agent::run_cycle_now`]
//! share one cycle lock, and the loop waits the full interval after a cycle
//! completes before starting the next. Across processes sharing a store, a
//! cycle also holds the agent's [`CycleLease`] for its whole duration.
//!
//! A terminal status the store failed to take is kept in memory and written
//! again at the start of the next cycle.

mod analyzer;
mod collector;
mod executor;
mod recorder;

pub use analyzer::{rank, ProfitabilityAnalyzer};
pub use collector::YieldCollector;
pub use executor::{ExecutionOutcome, ExecutionState, RebalanceExecutor};
pub use recorder::PerformanceRecorder;

use crate::config::{Config, OracleMode};
use crate::custody::{Custody, LocalCustody};
use crate::model::{
    AgentPerformanceAggregate, AgentStatus, AgentWallet, NetworkYieldSample, RebalanceDecision,
    RebalanceRecord, TimeWindow,
};
use crate::services::{
    with_timeout, CostModelQuoter, HttpOracle, PaperOracle, ProfitabilityQuoter, YieldOracle,
};
use crate::store::{CycleLease, JsonlStore, MemoryStore, Store};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything one cycle observed and did
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub samples: Vec<NetworkYieldSample>,
    pub decision: RebalanceDecision,
    pub execution: Option<ExecutionOutcome>,
    pub aggregate: AgentPerformanceAggregate,
    /// Earlier records whose terminal status reached the store this cycle
    pub settled: Vec<String>,
}

/// External services the agent depends on
#[derive(Clone)]
pub struct Collaborators {
    pub oracle: Arc<dyn YieldOracle>,
    pub quoter: Arc<dyn ProfitabilityQuoter>,
    pub custody: Arc<dyn Custody>,
    pub store: Arc<dyn Store>,
}

impl Collaborators {
    /// Build the collaborators selected by the configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        let timeout = Duration::from_millis(config.collaborator_timeout_ms);
        let oracle: Arc<dyn YieldOracle> = match config.oracle.mode {
            OracleMode::Paper => Arc::new(PaperOracle::from_config(&config.oracle)),
            OracleMode::Http => Arc::new(HttpOracle::from_config(&config.oracle, timeout)?),
        };
        let quoter = Arc::new(CostModelQuoter::new(config.costs.clone(), oracle.clone()));
        let store: Arc<dyn Store> = match &config.store.path {
            Some(path) => Arc::new(JsonlStore::open(path).await?),
            None => Arc::new(MemoryStore::new()),
        };

        Ok(Self {
            oracle,
            quoter,
            custody: Arc::new(LocalCustody::new()),
            store,
        })
    }
}

pub struct Agent {
    config: Config,
    collector: YieldCollector,
    analyzer: ProfitabilityAnalyzer,
    executor: RebalanceExecutor,
    recorder: PerformanceRecorder,
    custody: Arc<dyn Custody>,
    store: Arc<dyn Store>,
    wallet: Mutex<Option<AgentWallet>>,
    /// Lease owner id of this process
    owner: String,
    cycle_lock: Mutex<()>,
    unsettled: Mutex<Vec<RebalanceRecord>>,
    cycles: AtomicU64,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let timeout = Duration::from_millis(config.collaborator_timeout_ms);
        let Collaborators {
            oracle,
            quoter,
            custody,
            store,
        } = collaborators;

        let collector = YieldCollector::new(oracle, config.networks.clone(), timeout);
        let analyzer = ProfitabilityAnalyzer::new(quoter, config.strategy.clone(), timeout);
        let executor = RebalanceExecutor::new(
            config.agent_id.clone(),
            config.strategy.asset.clone(),
            config.custody.vault_address.clone(),
            custody.clone(),
            store.clone(),
            timeout,
        );
        let recorder = PerformanceRecorder::new(
            config.agent_id.clone(),
            store.clone(),
            config.initial_allocation.clone(),
        );
        let (stop_tx, _) = watch::channel(false);

        Self {
            config,
            collector,
            analyzer,
            executor,
            recorder,
            custody,
            store,
            wallet: Mutex::new(None),
            owner: uuid::Uuid::new_v4().to_string(),
            cycle_lock: Mutex::new(()),
            unsettled: Mutex::new(Vec::new()),
            cycles: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    /// Build an agent with the collaborators selected by `config`
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let collaborators = Collaborators::from_config(&config).await?;
        Ok(Self::new(config, collaborators))
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of cycles attempted so far, scheduled or manual
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub async fn wallet(&self) -> Option<AgentWallet> {
        self.wallet.lock().await.clone()
    }

    /// Create the agent wallet and request the configured grant.
    ///
    /// Idempotent: later calls return the wallet created by the first.
    pub async fn provision(&self) -> Result<AgentWallet> {
        let mut slot = self.wallet.lock().await;
        if let Some(wallet) = slot.as_ref() {
            return Ok(wallet.clone());
        }

        let timeout = Duration::from_millis(self.config.collaborator_timeout_ms);
        let wallet = with_timeout(
            "create_wallet",
            timeout,
            self.custody
                .create_wallet(&self.config.agent_id, self.config.custody.wallet_network),
        )
        .await?;
        info!(
            agent_id = %wallet.agent_id,
            address = %wallet.address,
            network = %wallet.network,
            "Agent wallet created"
        );

        if let Some(auth) = &self.config.authorization {
            let grant_id = with_timeout(
                "grant_authorization",
                timeout,
                self.custody.grant_authorization(
                    &auth.grantor,
                    &self.config.agent_id,
                    auth.amount_ceiling,
                    auth.frequency,
                ),
            )
            .await?;
            info!(
                grant_id = %grant_id,
                grantor = %auth.grantor,
                amount_ceiling = auth.amount_ceiling,
                frequency = ?auth.frequency,
                "Authorization granted"
            );
        }

        *slot = Some(wallet.clone());
        Ok(wallet)
    }

    /// Current aggregate, seeded from the initial allocation if none is stored
    pub async fn status(&self) -> Result<AgentPerformanceAggregate> {
        self.recorder.load_aggregate().await
    }

    /// This agent's rebalance records inside `window`
    pub async fn history(&self, window: TimeWindow) -> Result<Vec<RebalanceRecord>> {
        self.store.rebalances(&self.config.agent_id, window).await
    }

    /// Latest performance rows of this agent, newest first
    pub async fn performance_history(&self, limit: usize) -> Result<Vec<AgentPerformanceAggregate>> {
        self.recorder.performance_history(limit).await
    }

    /// Run one monitor, decide, execute, record cycle immediately.
    ///
    /// Waits for any cycle already in progress in this process. Fails with
    /// [`Error::CycleInProgress`] while another process holds the agent's
    /// cycle lease.
    pub async fn run_cycle_now(&self) -> Result<CycleReport> {
        let _guard = self.cycle_lock.lock().await;

        let lease = CycleLease {
            agent_id: self.config.agent_id.clone(),
            owner: self.owner.clone(),
            expires_at: Utc::now()
                .checked_add_signed(self.lease_span())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        if !self.store.acquire_cycle_lease(&lease).await? {
            warn!(agent_id = %self.config.agent_id, "Cycle lease held by another process");
            return Err(Error::CycleInProgress(self.config.agent_id.clone()));
        }

        self.cycles.fetch_add(1, Ordering::SeqCst);
        let report = self.cycle().await;

        if let Err(e) = self
            .store
            .release_cycle_lease(&self.config.agent_id, &self.owner)
            .await
        {
            warn!(error = %e, "Failed to release cycle lease");
        }
        report
    }

    /// Long enough for every collaborator call of a cycle to time out twice
    fn lease_span(&self) -> chrono::Duration {
        let calls = self.config.networks.len() as u64 + 8;
        let millis = self
            .config
            .collaborator_timeout_ms
            .saturating_mul(calls)
            .saturating_mul(2);
        i64::try_from(millis)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or_else(|| chrono::Duration::days(1))
    }

    /// Retry terminal writes the store refused in earlier cycles
    async fn settle_unsettled(&self) -> Vec<String> {
        let mut unsettled = self.unsettled.lock().await;
        let mut settled = Vec::new();
        let mut remaining = Vec::new();
        for record in unsettled.drain(..) {
            match self.executor.settle(&record).await {
                Ok(stored) => settled.push(stored.transaction_ref),
                Err(e) => {
                    warn!(
                        transaction_ref = %record.transaction_ref,
                        error = %e,
                        "Rebalance status still not persisted"
                    );
                    remaining.push(record);
                }
            }
        }
        *unsettled = remaining;
        settled
    }

    async fn cycle(&self) -> Result<CycleReport> {
        let started_at = Utc::now();
        info!(agent_id = %self.config.agent_id, "Starting rebalance cycle");

        let settled = self.settle_unsettled().await;

        let samples = self.collector.collect().await;
        info!(
            sampled = samples.len(),
            networks = self.collector.networks().len(),
            "Collected yields"
        );
        self.recorder.record_snapshots(&samples).await;

        let aggregate = self.recorder.load_aggregate().await?;
        let decision = match self.cooldown_remaining(&aggregate) {
            Some(remaining) => {
                info!(remaining_secs = remaining.num_seconds(), "Cooldown active");
                RebalanceDecision::rejected("cooldown active")
            }
            None => {
                self.analyzer
                    .analyze(&samples, aggregate.current_allocation())
                    .await
            }
        };

        let execution = if decision.approved {
            info!(
                source = ?decision.source_network,
                target = ?decision.target_network,
                amount = decision.amount,
                gain = decision.expected_apr_gain,
                "Rebalance approved"
            );
            let wallet = self.provision().await?;
            let outcome = self.executor.execute(&wallet, &decision).await?;
            if !outcome.persisted {
                self.unsettled.lock().await.push(outcome.record.clone());
            }
            Some(outcome)
        } else {
            info!(reason = %decision.reason, "No rebalance this cycle");
            None
        };

        let status = if self.is_running() {
            AgentStatus::Active
        } else {
            aggregate.status
        };
        let aggregate = self
            .recorder
            .update_aggregate(aggregate, execution.as_ref(), &samples, status)
            .await?;

        info!(
            total_value_managed = aggregate.total_value_managed,
            current_apr = aggregate.current_apr,
            total_rebalances = aggregate.total_rebalances,
            "Cycle complete"
        );

        Ok(CycleReport {
            started_at,
            samples,
            decision,
            execution,
            aggregate,
            settled,
        })
    }

    fn cooldown_remaining(&self, aggregate: &AgentPerformanceAggregate) -> Option<chrono::Duration> {
        let cooldown = self.config.strategy.cooldown_seconds;
        if cooldown == 0 {
            return None;
        }
        let last = aggregate.last_rebalance_at?;
        // A cooldown past the representable range never ends.
        let ends = i64::try_from(cooldown)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|span| last.checked_add_signed(span))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let now = Utc::now();
        (ends > now).then(|| ends - now)
    }

    /// Start the scheduled loop. Returns `false` if it was already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock().await;
        if self.is_running() {
            info!(agent_id = %self.config.agent_id, "Agent already running");
            return false;
        }
        // A stopped loop may still be finishing its last cycle.
        if let Some(previous) = task.take() {
            if let Err(e) = previous.await {
                warn!(error = %e, "Previous agent loop ended abnormally");
            }
        }

        self.running.store(true, Ordering::SeqCst);
        self.stop_tx.send_replace(false);
        let agent = Arc::clone(self);
        *task = Some(tokio::spawn(async move { agent.run_loop().await }));
        info!(
            agent_id = %self.config.agent_id,
            interval_ms = self.config.check_interval_ms,
            "Agent started"
        );
        true
    }

    /// Ask the loop to stop after the cycle in progress
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(agent_id = %self.config.agent_id, "Stop requested");
        }
        self.stop_tx.send_replace(true);
    }

    /// Stop and wait for the loop to exit
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Agent loop ended abnormally");
            }
        }
    }

    /// Status writes queue behind any cycle in progress, so a cycle
    /// finishing late cannot overwrite them.
    async fn record_status(&self, status: AgentStatus) {
        let _guard = self.cycle_lock.lock().await;
        if let Err(e) = self.recorder.set_status(status).await {
            error!(error = %e, status = ?status, "Failed to record agent status");
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.check_interval_ms);
        let mut stop_rx = self.stop_tx.subscribe();

        self.record_status(AgentStatus::Active).await;

        while self.is_running() {
            match self.run_cycle_now().await {
                Ok(report) => {
                    if let Some(outcome) = &report.execution {
                        info!(
                            transaction_ref = %outcome.record.transaction_ref,
                            status = %outcome.record.status,
                            persisted = outcome.persisted,
                            "Cycle executed rebalance"
                        );
                    }
                }
                Err(e) => error!(agent_id = %self.config.agent_id, error = %e, "Cycle failed"),
            }

            if !self.is_running() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.wait_for(|stopped| *stopped) => {}
            }
        }

        self.record_status(AgentStatus::Stopped).await;
        info!(agent_id = %self.config.agent_id, cycles = self.cycles(), "Agent stopped");
    }
}
