//! In-process custody
//!
//! Provisions wallets from local random keys and keeps authorization grants
//! with a per-period spending ledger. Invocations are signed but never
//! broadcast: the transaction ref is derived from the signature over the
//! call payload, so every submission has a unique, verifiable reference.

use super::{Custody, SecureWallet};
use crate::config::Network;
use crate::model::{AgentWallet, AuthorizationGrant, GrantFrequency};
use crate::{Error, Result};
use alloy::primitives::{keccak256, Address};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Spending tracked against one grant, reset every period
struct GrantLedger {
    grant: AuthorizationGrant,
    spent: f64,
    period_start: DateTime<Utc>,
}

impl GrantLedger {
    fn new(grant: AuthorizationGrant) -> Self {
        let period_start = grant.granted_at;
        Self {
            grant,
            spent: 0.0,
            period_start,
        }
    }

    /// Spent in the current period, resetting if the period rolled over
    fn current_spent(&mut self, now: DateTime<Utc>) -> f64 {
        let period = self.grant.frequency.period();
        if now - self.period_start >= period {
            let elapsed_periods = (now - self.period_start).num_seconds() / period.num_seconds();
            self.period_start += period * elapsed_periods as i32;
            self.spent = 0.0;
        }
        self.spent
    }
}

struct WalletEntry {
    agent_id: String,
    wallet: SecureWallet,
    nonce: AtomicU64,
}

#[derive(Default)]
pub struct LocalCustody {
    /// Wallets keyed by address
    wallets: RwLock<HashMap<Address, WalletEntry>>,
    /// Grants keyed by agent id
    grants: RwLock<HashMap<String, GrantLedger>>,
}

impl LocalCustody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Amount still available to the agent this period
    pub async fn remaining(&self, agent_id: &str) -> Option<f64> {
        let mut grants = self.grants.write().await;
        let ledger = grants.get_mut(agent_id)?;
        let spent = ledger.current_spent(Utc::now());
        Some((ledger.grant.amount_ceiling - spent).max(0.0))
    }
}

#[async_trait]
impl Custody for LocalCustody {
    async fn create_wallet(&self, agent_id: &str, network: Network) -> Result<AgentWallet> {
        let wallet = SecureWallet::random();
        let address = wallet.address();
        let agent_wallet = AgentWallet {
            agent_id: agent_id.to_string(),
            address: wallet.address_string(),
            network,
            network_id: network.chain_id(),
        };

        self.wallets.write().await.insert(
            address,
            WalletEntry {
                agent_id: agent_id.to_string(),
                wallet,
                nonce: AtomicU64::new(0),
            },
        );

        tracing::info!(
            agent_id,
            address = %agent_wallet.address,
            network = %network,
            "Created agent wallet"
        );
        Ok(agent_wallet)
    }

    async fn invoke(
        &self,
        wallet: &AgentWallet,
        contract_address: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<String> {
        let from = Address::from_str(&wallet.address)
            .map_err(|e| Error::Custody(format!("Invalid wallet address: {}", e)))?;
        let contract = Address::from_str(contract_address)
            .map_err(|e| Error::Custody(format!("Invalid contract address: {}", e)))?;

        let wallets = self.wallets.read().await;
        let entry = wallets
            .get(&from)
            .ok_or_else(|| Error::Custody(format!("Agent wallet {} not found", wallet.address)))?;
        if entry.agent_id != wallet.agent_id {
            return Err(Error::Custody(format!(
                "Wallet {} is not owned by agent {}",
                wallet.address, wallet.agent_id
            )));
        }

        let nonce = entry.nonce.fetch_add(1, Ordering::SeqCst);
        let payload = json!({
            "chain_id": wallet.network_id,
            "from": wallet.address,
            "to": contract.to_checksum(None),
            "method": method,
            "args": args,
            "nonce": nonce,
        });
        let payload_hash = keccak256(serde_json::to_vec(&payload)?);
        let signature = entry.wallet.sign_hash(&payload_hash)?;
        let tx_ref = keccak256(signature.as_bytes()).to_string();

        tracing::info!(
            agent_id = %wallet.agent_id,
            contract = %contract,
            method,
            nonce,
            tx_ref = %tx_ref,
            "Invoked contract from agent wallet"
        );
        Ok(tx_ref)
    }

    async fn grant_authorization(
        &self,
        grantor: &str,
        agent_id: &str,
        amount_ceiling: f64,
        frequency: GrantFrequency,
    ) -> Result<String> {
        if amount_ceiling.is_nan() || amount_ceiling <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "authorization ceiling must be positive, got {}",
                amount_ceiling
            )));
        }

        let grant = AuthorizationGrant {
            grant_id: format!("auth-{}", uuid::Uuid::new_v4()),
            grantor: grantor.to_string(),
            agent_id: agent_id.to_string(),
            amount_ceiling,
            frequency,
            granted_at: Utc::now(),
        };
        let grant_id = grant.grant_id.clone();

        self.grants
            .write()
            .await
            .insert(agent_id.to_string(), GrantLedger::new(grant));

        tracing::info!(
            grantor,
            agent_id,
            amount_ceiling,
            frequency = ?frequency,
            grant_id = %grant_id,
            "Granted authorization"
        );
        Ok(grant_id)
    }

    async fn check_authorization(&self, agent_id: &str, amount: f64) -> Result<bool> {
        let mut grants = self.grants.write().await;
        let Some(ledger) = grants.get_mut(agent_id) else {
            tracing::warn!(agent_id, "No authorization grant for agent");
            return Ok(false);
        };

        let spent = ledger.current_spent(Utc::now());
        let allowed = amount > 0.0 && spent + amount <= ledger.grant.amount_ceiling;
        tracing::debug!(
            agent_id,
            amount,
            spent,
            ceiling = ledger.grant.amount_ceiling,
            allowed,
            "Checked authorization"
        );
        Ok(allowed)
    }

    async fn record_spend(&self, agent_id: &str, amount: f64) -> Result<()> {
        let mut grants = self.grants.write().await;
        let ledger = grants
            .get_mut(agent_id)
            .ok_or_else(|| Error::Authorization(format!("no grant for agent {}", agent_id)))?;
        ledger.current_spent(Utc::now());
        ledger.spent += amount;
        tracing::info!(
            agent_id,
            amount,
            spent = ledger.spent,
            "Updated authorization spending"
        );
        Ok(())
    }
}
