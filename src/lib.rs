//! Cross-network yield rebalancing agent
//!
//! An autonomous agent that keeps capital on the network paying the best
//! yield:
//! - Samples APR/TVL for every configured network each cycle
//! - Moves capital when the APR gain clears a threshold and pays for its costs
//! - Executes moves through custody under an owner authorization grant
//! - Records every snapshot, rebalance attempt and a per-agent aggregate
//!
//! # Safety Model
//!
//! - A rebalance record is persisted as pending before anything is submitted
//! - Transfers are only submitted within the owner's authorization ceiling
//! - Wallet keys never leave the custody module
//! - Cycles of one agent never overlap

pub mod agent;
pub mod config;
pub mod custody;
pub mod model;
pub mod services;
pub mod stats;
pub mod store;

mod error;
#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use agent::{Agent, Collaborators, CycleReport, ExecutionOutcome, ExecutionState};
pub use config::{Config, Network, OracleMode, AGENT_ID_ENV, HERMES_URL_ENV, YIELD_API_URL_ENV};
pub use error::{Error, Result};
pub use model::{
    AgentPerformanceAggregate, AgentStatus, NetworkYieldSample, RebalanceDecision,
    RebalanceRecord, RebalanceStatus, TimeWindow,
};
pub use stats::{ChainMetrics, StatsReport, TotalStats};
