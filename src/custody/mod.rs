//! Custody and spending authorization
//!
//! The agent never holds keys itself. It asks custody for a wallet, moves
//! funds by invoking the vault contract through that wallet, and checks the
//! owner's authorization grant before every move.

mod local;
mod wallet;

pub use local::LocalCustody;
pub use wallet::SecureWallet;

use crate::config::Network;
use crate::model::{AgentWallet, GrantFrequency};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Custody: Send + Sync {
    /// Provision a wallet owned by `agent_id` on `network`
    async fn create_wallet(&self, agent_id: &str, network: Network) -> Result<AgentWallet>;

    /// Call `method` on `contract_address` from the agent wallet; returns the transaction ref
    async fn invoke(
        &self,
        wallet: &AgentWallet,
        contract_address: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<String>;

    /// Record an owner grant for an agent; returns the grant id
    async fn grant_authorization(
        &self,
        grantor: &str,
        agent_id: &str,
        amount_ceiling: f64,
        frequency: GrantFrequency,
    ) -> Result<String>;

    /// Whether the agent may move `amount` right now
    async fn check_authorization(&self, agent_id: &str, amount: f64) -> Result<bool>;

    /// Count a completed move against the agent's grant
    async fn record_spend(&self, _agent_id: &str, _amount: f64) -> Result<()> {
        Ok(())
    }
}
