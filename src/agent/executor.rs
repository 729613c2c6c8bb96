//! Rebalance execution state machine
//!
//! ```text
//! Initiated -> AuthChecked -> Submitted -> Confirmed
//!     |                           |
//!     +--------> Failed <---------+
//! ```
//!
//! The pending record is persisted before anything is submitted, so every
//! transfer custody ever sees has a durable trace.

use crate::custody::Custody;
use crate::model::{AgentWallet, RebalanceDecision, RebalanceRecord, StatusUpdate};
use crate::services::with_timeout;
use crate::store::Store;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Initiated,
    AuthChecked,
    Submitted,
    Confirmed,
    Failed,
}

/// Result of driving one approved decision to a terminal state
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub state: ExecutionState,
    pub record: RebalanceRecord,
    /// States visited, in order
    pub transitions: Vec<ExecutionState>,
    /// Whether the terminal status reached the store
    pub persisted: bool,
}

impl ExecutionOutcome {
    pub fn confirmed(&self) -> bool {
        self.state == ExecutionState::Confirmed
    }
}

pub struct RebalanceExecutor {
    agent_id: String,
    asset: String,
    vault_address: String,
    custody: Arc<dyn Custody>,
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl RebalanceExecutor {
    pub fn new(
        agent_id: impl Into<String>,
        asset: impl Into<String>,
        vault_address: impl Into<String>,
        custody: Arc<dyn Custody>,
        store: Arc<dyn Store>,
        timeout: Duration,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            asset: asset.into(),
            vault_address: vault_address.into(),
            custody,
            store,
            timeout,
        }
    }

    /// Execute an approved decision.
    ///
    /// Returns `Err` only when the decision is not approved or the pending
    /// record cannot be stored; in that case nothing was submitted.
    pub async fn execute(
        &self,
        wallet: &AgentWallet,
        decision: &RebalanceDecision,
    ) -> Result<ExecutionOutcome> {
        let mut record = RebalanceRecord::pending(&self.agent_id, decision, &self.asset)?;
        let mut transitions = vec![ExecutionState::Initiated];

        info!(
            transaction_ref = %record.transaction_ref,
            source = %record.source_network,
            target = %record.target_network,
            amount = record.amount,
            "Rebalance initiated"
        );

        let authorized = with_timeout(
            "check_authorization",
            self.timeout,
            self.custody.check_authorization(&self.agent_id, record.amount),
        )
        .await;
        let denial = match authorized {
            Ok(true) => None,
            Ok(false) => Some(format!(
                "authorization insufficient: no grant covers {} {}",
                record.amount, record.asset
            )),
            Err(e) => Some(format!("authorization insufficient: {}", e)),
        };
        if let Some(reason) = denial {
            warn!(transaction_ref = %record.transaction_ref, reason = %reason, "Rebalance not authorized");
            record.apply(StatusUpdate::failed(reason))?;
            transitions.push(ExecutionState::Failed);
            let persisted = match self.store.insert_rebalance(&record).await {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        transaction_ref = %record.transaction_ref,
                        error = %e,
                        "Failed to persist rejected rebalance"
                    );
                    false
                }
            };
            return Ok(ExecutionOutcome {
                state: ExecutionState::Failed,
                record,
                transitions,
                persisted,
            });
        }
        transitions.push(ExecutionState::AuthChecked);

        self.store.insert_rebalance(&record).await.map_err(|e| {
            error!(
                transaction_ref = %record.transaction_ref,
                error = %e,
                "Failed to persist pending rebalance, not submitting"
            );
            Error::Persistence(format!(
                "pending record {} not stored: {}",
                record.transaction_ref, e
            ))
        })?;

        transitions.push(ExecutionState::Submitted);
        let args = vec![
            json!(record.target_network.chain_id()),
            json!(record.amount),
            json!(record.source_network.chain_id()),
            json!(record.transaction_ref),
        ];
        let submitted = with_timeout(
            "invoke",
            self.timeout,
            self.custody.invoke(wallet, &self.vault_address, "rebalance", args),
        )
        .await;

        let (update, state) = match submitted {
            Ok(tx_hash) => {
                info!(
                    transaction_ref = %record.transaction_ref,
                    tx_hash = %tx_hash,
                    "Rebalance confirmed"
                );
                if let Err(e) = self
                    .custody
                    .record_spend(&self.agent_id, record.amount)
                    .await
                {
                    warn!(error = %e, "Failed to record authorization spend");
                }
                (StatusUpdate::confirmed(Some(tx_hash)), ExecutionState::Confirmed)
            }
            Err(e) => {
                warn!(
                    transaction_ref = %record.transaction_ref,
                    error = %e,
                    "Rebalance failed"
                );
                (StatusUpdate::failed(e.to_string()), ExecutionState::Failed)
            }
        };
        transitions.push(state);

        let persisted = match self
            .store
            .update_status(&record.transaction_ref, update.clone())
            .await
        {
            Ok(stored) => {
                record = stored;
                true
            }
            Err(e) => {
                // The transfer already happened (or failed); the stored record stays pending.
                error!(
                    transaction_ref = %record.transaction_ref,
                    status = %update.status(),
                    error = %e,
                    "Failed to persist terminal rebalance status"
                );
                record.apply(update)?;
                false
            }
        };

        Ok(ExecutionOutcome {
            state,
            record,
            transitions,
            persisted,
        })
    }

    /// Write a terminal record the store missed when it was produced.
    ///
    /// Inserts it if the store never saw it and completes it if the stored
    /// copy is still pending. A stored terminal copy wins.
    pub async fn settle(&self, record: &RebalanceRecord) -> Result<RebalanceRecord> {
        let update = StatusUpdate::from_record(record).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "rebalance {} has no terminal status to settle",
                record.transaction_ref
            ))
        })?;

        let settled = match self.store.get_rebalance(&record.transaction_ref).await? {
            None => {
                self.store.insert_rebalance(record).await?;
                record.clone()
            }
            Some(stored) if stored.status.is_terminal() => stored,
            Some(_) => {
                self.store
                    .update_status(&record.transaction_ref, update)
                    .await?
            }
        };
        info!(
            transaction_ref = %settled.transaction_ref,
            status = %settled.status,
            "Settled rebalance status"
        );
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::model::{RebalanceStatus, TimeWindow};
    use crate::testing::{FakeCustody, FlakyStore};
    use std::sync::atomic::Ordering;

    fn decision() -> RebalanceDecision {
        RebalanceDecision {
            approved: true,
            source_network: Some(Network::Base),
            target_network: Some(Network::Polygon),
            amount: 400.0,
            source_apr: 4.0,
            target_apr: 11.0,
            expected_apr_gain: 7.0,
            reason: "test".to_string(),
        }
    }

    fn wallet() -> AgentWallet {
        AgentWallet {
            agent_id: "agent-1".to_string(),
            address: format!("0x{:040x}", 1),
            network: Network::Base,
            network_id: 8453,
        }
    }

    fn executor(custody: Arc<FakeCustody>, store: Arc<FlakyStore>) -> RebalanceExecutor {
        RebalanceExecutor::new(
            "agent-1",
            "USDC",
            "0x0000000000000000000000000000000000000001",
            custody,
            store,
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn test_confirmed_rebalance() {
        let custody = Arc::new(FakeCustody::new(true));
        let store = Arc::new(FlakyStore::default());

        let outcome = executor(custody.clone(), store.clone())
            .execute(&wallet(), &decision())
            .await
            .unwrap();

        assert_eq!(outcome.state, ExecutionState::Confirmed);
        assert_eq!(
            outcome.transitions,
            vec![
                ExecutionState::Initiated,
                ExecutionState::AuthChecked,
                ExecutionState::Submitted,
                ExecutionState::Confirmed,
            ]
        );
        assert!(outcome.persisted);
        assert_eq!(outcome.record.status, RebalanceStatus::Confirmed);
        assert!(outcome.record.confirmed_at.is_some());
        assert!(outcome.record.tx_hash.is_some());
        assert_eq!(*custody.spent.lock().unwrap(), 400.0);

        let stored = store
            .get_rebalance(&outcome.record.transaction_ref)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, outcome.record);
    }

    #[tokio::test]
    async fn test_insufficient_authorization_never_submits() {
        let custody = Arc::new(FakeCustody::new(false));
        let store = Arc::new(FlakyStore::default());

        let outcome = executor(custody.clone(), store.clone())
            .execute(&wallet(), &decision())
            .await
            .unwrap();

        assert_eq!(outcome.state, ExecutionState::Failed);
        assert_eq!(custody.invocations(), 0);
        assert!(outcome
            .record
            .error_message
            .as_deref()
            .unwrap()
            .contains("authorization"));

        let records = store.rebalances("agent-1", TimeWindow::all()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RebalanceStatus::Failed);
    }

    #[tokio::test]
    async fn test_custody_failure_marks_record_failed() {
        let custody = Arc::new(FakeCustody::new(true));
        custody.fail_invoke.store(true, Ordering::SeqCst);
        let store = Arc::new(FlakyStore::default());

        let outcome = executor(custody.clone(), store.clone())
            .execute(&wallet(), &decision())
            .await
            .unwrap();

        assert_eq!(outcome.state, ExecutionState::Failed);
        assert_eq!(custody.invocations(), 1);
        assert_eq!(*custody.spent.lock().unwrap(), 0.0);
        let stored = store
            .get_rebalance(&outcome.record.transaction_ref)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RebalanceStatus::Failed);
        assert!(stored.error_message.unwrap().contains("bridge reverted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custody_timeout_marks_record_failed() {
        let custody = Arc::new(FakeCustody::new(true));
        *custody.invoke_delay.lock().unwrap() = Duration::from_secs(60);
        let store = Arc::new(FlakyStore::default());

        let outcome = executor(custody, store)
            .execute(&wallet(), &decision())
            .await
            .unwrap();

        assert_eq!(outcome.state, ExecutionState::Failed);
        assert!(outcome.record.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_pending_write_failure_prevents_submission() {
        let custody = Arc::new(FakeCustody::new(true));
        let store = Arc::new(FlakyStore::default());
        store.fail_insert_rebalance.store(true, Ordering::SeqCst);

        let result = executor(custody.clone(), store)
            .execute(&wallet(), &decision())
            .await;
        let err = tokio_test::assert_err!(result);

        assert!(matches!(err, Error::Persistence(_)));
        assert_eq!(custody.invocations(), 0);
    }

    #[tokio::test]
    async fn test_status_write_failure_is_reported() {
        let custody = Arc::new(FakeCustody::new(true));
        let store = Arc::new(FlakyStore::default());
        store.fail_update_status.store(true, Ordering::SeqCst);

        let outcome = tokio_test::assert_ok!(
            executor(custody, store.clone())
                .execute(&wallet(), &decision())
                .await
        );

        assert_eq!(outcome.state, ExecutionState::Confirmed);
        assert!(!outcome.persisted);
        let stored = store
            .get_rebalance(&outcome.record.transaction_ref)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RebalanceStatus::Pending);
    }

    #[tokio::test]
    async fn test_unpersisted_status_settles_after_store_recovers() {
        let custody = Arc::new(FakeCustody::new(true));
        let store = Arc::new(FlakyStore::default());
        let executor = executor(custody, store.clone());
        store.fail_update_status.store(true, Ordering::SeqCst);

        let outcome = executor.execute(&wallet(), &decision()).await.unwrap();
        assert!(!outcome.persisted);
        tokio_test::assert_err!(executor.settle(&outcome.record).await);

        store.fail_update_status.store(false, Ordering::SeqCst);
        let settled = executor.settle(&outcome.record).await.unwrap();
        assert_eq!(settled, outcome.record);

        let stored = store
            .get_rebalance(&outcome.record.transaction_ref)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RebalanceStatus::Confirmed);
        assert_eq!(stored.tx_hash, outcome.record.tx_hash);

        // A second settle leaves the terminal record alone
        assert_eq!(executor.settle(&outcome.record).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_unstored_denial_is_inserted_on_settle() {
        let custody = Arc::new(FakeCustody::new(false));
        let store = Arc::new(FlakyStore::default());
        let executor = executor(custody, store.clone());
        store.fail_insert_rebalance.store(true, Ordering::SeqCst);

        let outcome = executor.execute(&wallet(), &decision()).await.unwrap();
        assert!(!outcome.persisted);
        assert!(store.rebalances("agent-1", TimeWindow::all()).await.unwrap().is_empty());

        store.fail_insert_rebalance.store(false, Ordering::SeqCst);
        executor.settle(&outcome.record).await.unwrap();
        let records = store.rebalances("agent-1", TimeWindow::all()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RebalanceStatus::Failed);
    }

    #[tokio::test]
    async fn test_rejected_decision_is_refused() {
        let custody = Arc::new(FakeCustody::new(true));
        let store = Arc::new(FlakyStore::default());
        let result = executor(custody, store)
            .execute(&wallet(), &RebalanceDecision::rejected("no"))
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
