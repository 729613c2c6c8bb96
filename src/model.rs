//! Domain records shared by the agent, its collaborators and the store

use crate::config::Network;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Yield reading for one network, taken once per cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkYieldSample {
    pub network: Network,
    pub network_id: u64,
    /// Percent, e.g. 7.5 for 7.5%
    pub apr: f64,
    pub tvl: f64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of the profitability analysis for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceDecision {
    pub approved: bool,
    pub source_network: Option<Network>,
    pub target_network: Option<Network>,
    pub amount: f64,
    pub source_apr: f64,
    pub target_apr: f64,
    pub expected_apr_gain: f64,
    pub reason: String,
}

impl RebalanceDecision {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            source_network: None,
            target_network: None,
            amount: 0.0,
            source_apr: 0.0,
            target_apr: 0.0,
            expected_apr_gain: 0.0,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceStatus {
    Pending,
    Confirmed,
    Failed,
}

impl RebalanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RebalanceStatus::Pending)
    }
}

impl fmt::Display for RebalanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceStatus::Pending => f.write_str("pending"),
            RebalanceStatus::Confirmed => f.write_str("confirmed"),
            RebalanceStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Terminal transition applied to a pending record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusUpdate {
    Confirmed {
        confirmed_at: DateTime<Utc>,
        /// Hash reported by custody for the underlying transfer
        tx_hash: Option<String>,
    },
    Failed { error_message: String },
}

impl StatusUpdate {
    pub fn confirmed(tx_hash: Option<String>) -> Self {
        StatusUpdate::Confirmed {
            confirmed_at: Utc::now(),
            tx_hash,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        StatusUpdate::Failed {
            error_message: error_message.into(),
        }
    }

    pub fn status(&self) -> RebalanceStatus {
        match self {
            StatusUpdate::Confirmed { .. } => RebalanceStatus::Confirmed,
            StatusUpdate::Failed { .. } => RebalanceStatus::Failed,
        }
    }

    /// The transition that produced a terminal record; `None` while pending
    pub fn from_record(record: &RebalanceRecord) -> Option<Self> {
        match record.status {
            RebalanceStatus::Pending => None,
            RebalanceStatus::Confirmed => Some(StatusUpdate::Confirmed {
                confirmed_at: record.confirmed_at.unwrap_or(record.initiated_at),
                tx_hash: record.tx_hash.clone(),
            }),
            RebalanceStatus::Failed => Some(StatusUpdate::Failed {
                error_message: record.error_message.clone().unwrap_or_default(),
            }),
        }
    }
}

/// Durable trace of one rebalance attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecord {
    pub agent_id: String,
    /// Unique per record, assigned before submission
    pub transaction_ref: String,
    pub source_network: Network,
    pub target_network: Network,
    pub amount: f64,
    pub asset: String,
    pub source_apr: f64,
    pub target_apr: f64,
    pub status: RebalanceStatus,
    pub initiated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

impl RebalanceRecord {
    /// Build a pending record for an approved decision
    pub fn pending(agent_id: &str, decision: &RebalanceDecision, asset: &str) -> Result<Self> {
        let (source, target) = match (decision.source_network, decision.target_network) {
            (Some(source), Some(target)) if decision.approved => (source, target),
            _ => {
                return Err(Error::InvalidArgument(
                    "only an approved decision can start a rebalance".to_string(),
                ))
            }
        };

        Ok(Self {
            agent_id: agent_id.to_string(),
            transaction_ref: format!("rb-{}", uuid::Uuid::new_v4()),
            source_network: source,
            target_network: target,
            amount: decision.amount,
            asset: asset.to_string(),
            source_apr: decision.source_apr,
            target_apr: decision.target_apr,
            status: RebalanceStatus::Pending,
            initiated_at: Utc::now(),
            confirmed_at: None,
            error_message: None,
            tx_hash: None,
        })
    }

    /// Apply a terminal transition. Terminal records never change again.
    pub fn apply(&mut self, update: StatusUpdate) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::TerminalStatus(self.transaction_ref.clone()));
        }
        match update {
            StatusUpdate::Confirmed {
                confirmed_at,
                tx_hash,
            } => {
                self.status = RebalanceStatus::Confirmed;
                self.confirmed_at = Some(confirmed_at);
                self.error_message = None;
                self.tx_hash = tx_hash;
            }
            StatusUpdate::Failed { error_message } => {
                self.status = RebalanceStatus::Failed;
                self.error_message = Some(error_message);
            }
        }
        Ok(())
    }
}

/// Wallet provisioned by custody for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentWallet {
    pub agent_id: String,
    pub address: String,
    pub network: Network,
    pub network_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl GrantFrequency {
    /// Length of one spending period
    pub fn period(&self) -> Duration {
        match self {
            GrantFrequency::Daily => Duration::days(1),
            GrantFrequency::Weekly => Duration::weeks(1),
            GrantFrequency::Monthly => Duration::days(30),
        }
    }
}

/// Owner permission bounding how much an agent may move per period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationGrant {
    pub grant_id: String,
    pub grantor: String,
    pub agent_id: String,
    pub amount_ceiling: f64,
    pub frequency: GrantFrequency,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Active,
    Stopped,
}

/// Rolled-up agent state, upserted after every cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformanceAggregate {
    pub agent_id: String,
    pub total_value_managed: f64,
    pub current_apr: f64,
    pub total_rebalances: u64,
    pub successful_rebalances: u64,
    pub failed_rebalances: u64,
    pub chain_distribution: BTreeMap<Network, f64>,
    pub status: AgentStatus,
    pub last_rebalance_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AgentPerformanceAggregate {
    pub fn new(agent_id: &str, chain_distribution: BTreeMap<Network, f64>) -> Self {
        let mut aggregate = Self {
            agent_id: agent_id.to_string(),
            total_value_managed: 0.0,
            current_apr: 0.0,
            total_rebalances: 0,
            successful_rebalances: 0,
            failed_rebalances: 0,
            chain_distribution,
            status: AgentStatus::Idle,
            last_rebalance_at: None,
            updated_at: Utc::now(),
        };
        aggregate.total_value_managed = aggregate.chain_distribution.values().sum();
        aggregate
    }

    /// Network holding the most capital; ties go to the lower network name
    pub fn current_allocation(&self) -> Option<(Network, f64)> {
        self.chain_distribution
            .iter()
            .filter(|(_, amount)| **amount > 0.0)
            .max_by(|(na, a), (nb, b)| a.total_cmp(b).then_with(|| nb.name().cmp(na.name())))
            .map(|(network, amount)| (*network, *amount))
    }

    /// Move capital after a confirmed rebalance
    pub fn move_capital(&mut self, source: Network, target: Network, amount: f64) {
        let moved = {
            let held = self.chain_distribution.entry(source).or_insert(0.0);
            let moved = amount.min(*held);
            *held -= moved;
            moved
        };
        if self.chain_distribution.get(&source).is_some_and(|a| *a <= 0.0) {
            self.chain_distribution.remove(&source);
        }
        *self.chain_distribution.entry(target).or_insert(0.0) += moved;
    }

    /// Recompute counters and derived figures from terminal records and the latest samples
    pub fn recompute(&mut self, records: &[RebalanceRecord], samples: &[NetworkYieldSample]) {
        self.successful_rebalances = records
            .iter()
            .filter(|r| r.status == RebalanceStatus::Confirmed)
            .count() as u64;
        self.failed_rebalances = records
            .iter()
            .filter(|r| r.status == RebalanceStatus::Failed)
            .count() as u64;
        self.total_rebalances = self.successful_rebalances + self.failed_rebalances;
        self.last_rebalance_at = records
            .iter()
            .filter(|r| r.status.is_terminal())
            .map(|r| r.confirmed_at.unwrap_or(r.initiated_at))
            .max()
            .or(self.last_rebalance_at);

        self.total_value_managed = self.chain_distribution.values().sum();
        if self.total_value_managed > 0.0 && !samples.is_empty() {
            let weighted: f64 = self
                .chain_distribution
                .iter()
                .filter_map(|(network, amount)| {
                    samples
                        .iter()
                        .find(|s| s.network == *network)
                        .map(|s| s.apr * amount)
                })
                .sum();
            self.current_apr = weighted / self.total_value_managed;
        }
        self.updated_at = Utc::now();
    }
}

/// Optional `[since, until]` interval for history queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn all() -> Self {
        Self::default()
    }

    /// Window ending now and covering the last `hours`
    pub fn last_hours(hours: i64) -> Result<Self> {
        let since = Duration::try_hours(hours)
            .filter(|span| *span >= Duration::zero())
            .and_then(|span| Utc::now().checked_sub_signed(span))
            .ok_or_else(|| Error::InvalidArgument(format!("hours out of range: {}", hours)))?;
        Ok(Self {
            since: Some(since),
            until: None,
        })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.map_or(true, |since| at >= since) && self.until.map_or(true, |until| at <= until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approved() -> RebalanceDecision {
        RebalanceDecision {
            approved: true,
            source_network: Some(Network::Base),
            target_network: Some(Network::Polygon),
            amount: 500.0,
            source_apr: 5.0,
            target_apr: 12.0,
            expected_apr_gain: 7.0,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn pending_requires_approved_decision() {
        let rejected = RebalanceDecision::rejected("no");
        assert!(RebalanceRecord::pending("agent-1", &rejected, "USDC").is_err());

        let record = RebalanceRecord::pending("agent-1", &approved(), "USDC").unwrap();
        assert_eq!(record.status, RebalanceStatus::Pending);
        assert!(record.transaction_ref.starts_with("rb-"));
    }

    #[test]
    fn terminal_records_are_immutable() {
        let mut record = RebalanceRecord::pending("agent-1", &approved(), "USDC").unwrap();
        record
            .apply(StatusUpdate::confirmed(Some("0xabc".to_string())))
            .unwrap();
        assert_eq!(record.status, RebalanceStatus::Confirmed);
        assert!(record.confirmed_at.is_some());
        assert!(record.error_message.is_none());

        let before = record.clone();
        let err = record.apply(StatusUpdate::failed("late")).unwrap_err();
        assert!(matches!(err, Error::TerminalStatus(_)));
        assert_eq!(record, before);
    }

    #[test]
    fn failed_update_sets_error_message() {
        let mut record = RebalanceRecord::pending("agent-1", &approved(), "USDC").unwrap();
        record.apply(StatusUpdate::failed("bridge reverted")).unwrap();
        assert_eq!(record.status, RebalanceStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("bridge reverted"));
    }

    #[test]
    fn current_allocation_picks_largest_holding() {
        let aggregate = AgentPerformanceAggregate::new(
            "agent-1",
            BTreeMap::from([(Network::Base, 200.0), (Network::Celo, 800.0)]),
        );
        assert_eq!(aggregate.current_allocation(), Some((Network::Celo, 800.0)));
        assert_eq!(aggregate.total_value_managed, 1000.0);

        let empty = AgentPerformanceAggregate::new("agent-1", BTreeMap::new());
        assert_eq!(empty.current_allocation(), None);
    }

    #[test]
    fn move_capital_never_overdraws() {
        let mut aggregate =
            AgentPerformanceAggregate::new("agent-1", BTreeMap::from([(Network::Base, 300.0)]));
        aggregate.move_capital(Network::Base, Network::Polygon, 500.0);
        assert_eq!(aggregate.chain_distribution.get(&Network::Base), None);
        assert_eq!(aggregate.chain_distribution.get(&Network::Polygon), Some(&300.0));
    }

    #[test]
    fn recompute_keeps_counter_invariant() {
        let mut confirmed = RebalanceRecord::pending("agent-1", &approved(), "USDC").unwrap();
        confirmed.apply(StatusUpdate::confirmed(None)).unwrap();
        let mut failed = RebalanceRecord::pending("agent-1", &approved(), "USDC").unwrap();
        failed.apply(StatusUpdate::failed("boom")).unwrap();
        let pending = RebalanceRecord::pending("agent-1", &approved(), "USDC").unwrap();

        let mut aggregate =
            AgentPerformanceAggregate::new("agent-1", BTreeMap::from([(Network::Base, 100.0)]));
        let samples = vec![NetworkYieldSample {
            network: Network::Base,
            network_id: Network::Base.chain_id(),
            apr: 6.0,
            tvl: 1.0,
            timestamp: Utc::now(),
        }];
        aggregate.recompute(&[confirmed, failed, pending], &samples);

        assert_eq!(aggregate.successful_rebalances, 1);
        assert_eq!(aggregate.failed_rebalances, 1);
        assert_eq!(
            aggregate.total_rebalances,
            aggregate.successful_rebalances + aggregate.failed_rebalances
        );
        assert!((aggregate.current_apr - 6.0).abs() < f64::EPSILON);
        assert!(aggregate.last_rebalance_at.is_some());
    }

    #[test]
    fn time_window_bounds() {
        let now = Utc::now();
        let window = TimeWindow {
            since: Some(now - Duration::hours(1)),
            until: Some(now),
        };
        assert!(window.contains(now - Duration::minutes(30)));
        assert!(!window.contains(now - Duration::hours(2)));
        assert!(TimeWindow::all().contains(now - Duration::days(365)));
    }

    #[test]
    fn last_hours_rejects_out_of_range() {
        let window = TimeWindow::last_hours(24).unwrap();
        assert!(window.contains(Utc::now() - Duration::hours(1)));
        assert!(TimeWindow::last_hours(i64::MAX).is_err());
        assert!(TimeWindow::last_hours(-1).is_err());
    }

    #[test]
    fn status_update_rebuilt_from_terminal_record() {
        let mut record = RebalanceRecord::pending("agent-1", &approved(), "USDC").unwrap();
        assert_eq!(StatusUpdate::from_record(&record), None);

        let update = StatusUpdate::confirmed(Some("0xabc".to_string()));
        record.apply(update.clone()).unwrap();
        assert_eq!(StatusUpdate::from_record(&record), Some(update));
    }
}
