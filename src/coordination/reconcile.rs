//! Reconciliation of timed-out deployments and startup recovery
//!
//! A record left in `deploying` or `link_deploying` has no worker once the
//! process that claimed it is gone. Startup recovery fails all of them; the
//! periodic sweep fails those idle for longer than one execution may take.

use super::engine::Orchestrator;
use crate::error::{ChainErrorCategory, DeployerResult};
use crate::model::{ConfigurationStatus, DeploymentRecord, DeploymentStatus};

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// What a receipt lookup found for a timed-out deployment
pub(super) enum Reconciled {
    /// Mined after all; carries peers promoted to `link_pending`
    Recovered(Vec<String>),
    /// Mined but reverted; the failure was reclassified
    Reverted,
    /// Not found, lookup failed, or the record moved on
    Unresolved,
}

impl Orchestrator {
    /// One sweep over stalled executions and timed-out deployments with a
    /// recorded transaction. Returns the number of records recovered to `success`.
    pub async fn reconcile(&self) -> DeployerResult<usize> {
        let max_age = chrono::Duration::from_std(self.config.max_execution_time())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let expired = self.interrupt_in_flight(Some(Utc::now() - max_age)).await?;
        if expired > 0 {
            warn!("Expired {} stalled executions", expired);
        }

        let candidates: Vec<_> = self
            .store
            .list_records_by_status(&[DeploymentStatus::Failed])
            .await?
            .into_iter()
            .filter(DeploymentRecord::is_reconcilable)
            .collect();

        if candidates.is_empty() {
            return Ok(0);
        }
        debug!("Reconciling {} timed-out deployments", candidates.len());

        let mut recovered = 0;
        for record in candidates {
            if let Reconciled::Recovered(promoted) = self.reconcile_record(&record).await? {
                recovered += 1;
                if !promoted.is_empty() {
                    let this = self.clone();
                    let configuration = self.load_configuration(record.configuration_id).await?;
                    tokio::spawn(async move {
                        this.link_promoted(&configuration, promoted).await;
                        if let Err(e) = this.hand_over_ownership(configuration.id).await {
                            warn!("Ownership hand-over of {} failed: {}", configuration.id, e);
                        }
                    });
                }
            }
        }

        Ok(recovered)
    }

    /// Look up the recorded deployment of a timed-out record
    pub(super) async fn reconcile_record(
        &self,
        record: &DeploymentRecord,
    ) -> DeployerResult<Reconciled> {
        if !record.is_reconcilable() {
            return Ok(Reconciled::Unresolved);
        }
        let Some(tx_id) = record.deployment_tx_id.as_deref() else {
            return Ok(Reconciled::Unresolved);
        };
        let chain = record.chain_id.as_str();

        let lookup = timeout(
            self.config.submit_timeout(),
            self.client.deployment_receipt(chain, tx_id),
        )
        .await;

        match lookup {
            Ok(Ok(Some(receipt))) => {
                let recovered =
                    record.reconcile_success(&receipt.contract_address, &receipt.tx_id, Utc::now())?;
                match self.settle(DeploymentStatus::Failed, &recovered).await? {
                    Some(promoted) => {
                        info!(
                            "Deployment {} on chain {} was mined at {}",
                            tx_id, chain, receipt.contract_address
                        );
                        crate::metrics::record_reconciled(chain);
                        Ok(Reconciled::Recovered(promoted))
                    }
                    None => Ok(Reconciled::Unresolved),
                }
            }
            Ok(Ok(None)) => {
                debug!("Deployment {} on chain {} not found yet", tx_id, chain);
                Ok(Reconciled::Unresolved)
            }
            Ok(Err(error)) if error.category == ChainErrorCategory::Reverted => {
                let reclassified = record.reclassify_failure(&error, Utc::now())?;
                match self.settle(DeploymentStatus::Failed, &reclassified).await? {
                    Some(_) => {
                        warn!("Deployment {} on chain {} reverted", tx_id, chain);
                        Ok(Reconciled::Reverted)
                    }
                    None => Ok(Reconciled::Unresolved),
                }
            }
            Ok(Err(error)) => {
                debug!("Receipt lookup for {} on chain {} failed: {}", tx_id, chain, error);
                Ok(Reconciled::Unresolved)
            }
            Err(_) => {
                debug!("Receipt lookup for {} on chain {} timed out", tx_id, chain);
                Ok(Reconciled::Unresolved)
            }
        }
    }

    /// Fail every execution a restart interrupted, then resume deploying
    /// configurations. Returns the number of records marked interrupted.
    pub async fn recover(&self) -> DeployerResult<usize> {
        let interrupted = self.interrupt_in_flight(None).await?;

        let resumable = self
            .store
            .list_configurations_by_status(ConfigurationStatus::Deploying)
            .await?;
        for configuration in &resumable {
            info!("Resuming deployment of configuration {}", configuration.id);
            self.spawn_configuration(configuration.id);
        }

        Ok(interrupted)
    }

    /// Mark in-flight records as timed out, only those idle since `idle_before`
    /// when given
    async fn interrupt_in_flight(&self, idle_before: Option<DateTime<Utc>>) -> DeployerResult<usize> {
        let in_flight = self
            .store
            .list_records_by_status(&[DeploymentStatus::Deploying, DeploymentStatus::LinkDeploying])
            .await?;

        let mut interrupted = 0;
        for record in in_flight {
            let last_activity = match record.status {
                DeploymentStatus::Deploying => record.last_attempt_at.unwrap_or(record.updated_at),
                _ => record.updated_at,
            };
            if idle_before.map_or(false, |cutoff| last_activity > cutoff) {
                continue;
            }

            let failed = record.mark_interrupted(Utc::now())?;
            if self.settle(record.status, &failed).await?.is_some() {
                warn!(
                    "Chain {} of {} stopped while {} (last activity {}); marked as timed out",
                    record.chain_id, record.configuration_id, record.status, last_activity
                );
                interrupted += 1;
            }
        }

        Ok(interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::error::ChainErrorCategory;
    use crate::model::{ConfigurationStatus, DeploymentStatus};
    use crate::state::DeploymentStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_sweep_recovers_mined_deployment_and_links_it() {
        let client = ScriptedClient::new();
        client.hang_await("base");
        let (orchestrator, store) = orchestrator_with(client.clone(), |c| {
            c.confirmation_timeout_ms = 50;
            c.max_auto_attempts = 1;
        });
        let id = paid_configuration(&orchestrator, &["ethereum", "base"]).await;
        orchestrator.start_deployment(id).await.unwrap().wait().await.unwrap();

        let base = store.get_record(id, "base").await.unwrap().unwrap();
        assert!(base.is_reconcilable());
        assert_eq!(
            orchestrator.get_status(id).await.unwrap().configuration.status,
            ConfigurationStatus::Partial
        );

        // Nothing mined yet: left for the next sweep
        assert_eq!(orchestrator.reconcile().await.unwrap(), 0);

        client.mine_on_lookup();
        assert_eq!(orchestrator.reconcile().await.unwrap(), 1);

        let base = store.get_record(id, "base").await.unwrap().unwrap();
        assert_eq!(base.attempt_count, 1);
        assert!(base.contract_address.is_some());
        assert!(matches!(
            base.status,
            DeploymentStatus::LinkPending | DeploymentStatus::LinkDeploying | DeploymentStatus::LinkSuccess
        ));

        wait_for_status(&orchestrator, id, ConfigurationStatus::Completed).await;
        assert_eq!(client.submissions("base"), 1);
    }

    #[tokio::test]
    async fn test_sweep_reclassifies_reverted_deployment() {
        let client = ScriptedClient::new();
        client.hang_await("base");
        let (orchestrator, store) = orchestrator_with(client.clone(), |c| {
            c.confirmation_timeout_ms = 50;
            c.max_auto_attempts = 1;
        });
        let id = paid_configuration(&orchestrator, &["base"]).await;
        orchestrator.start_deployment(id).await.unwrap().wait().await.unwrap();

        client.revert_on_lookup();
        assert_eq!(orchestrator.reconcile().await.unwrap(), 0);

        let base = store.get_record(id, "base").await.unwrap().unwrap();
        assert_eq!(base.status, DeploymentStatus::Failed);
        assert_eq!(base.last_error_category, Some(ChainErrorCategory::Reverted));
        assert!(!base.is_reconcilable());
    }

    #[tokio::test]
    async fn test_recover_marks_stale_executions_and_resumes() {
        let client = ScriptedClient::new();
        let (orchestrator, store) = orchestrator(client.clone());
        let id = paid_configuration(&orchestrator, &["ethereum", "base"]).await;

        // Simulate a crash: configuration started, hub mid-deployment long ago
        store
            .transition_configuration(id, ConfigurationStatus::Pending, ConfigurationStatus::Deploying)
            .await
            .unwrap();
        let hub = store.get_record(id, "ethereum").await.unwrap().unwrap();
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        let stale = hub
            .begin_attempt(long_ago)
            .and_then(|r| r.with_submission(&tx_hash(99), long_ago))
            .unwrap();
        assert!(store
            .compare_and_swap_record(DeploymentStatus::Pending, &stale)
            .await
            .unwrap());

        assert_eq!(orchestrator.recover().await.unwrap(), 1);

        let hub = store.get_record(id, "ethereum").await.unwrap().unwrap();
        assert_eq!(hub.status, DeploymentStatus::Failed);
        assert_eq!(hub.last_error_category, Some(ChainErrorCategory::Timeout));
        assert!(hub.is_reconcilable());

        // The pending peer was resumed and deployed
        wait_for_record(&orchestrator, id, "base", DeploymentStatus::Success).await;
        wait_for_status(&orchestrator, id, ConfigurationStatus::Partial).await;
        assert_eq!(client.submissions("ethereum"), 0);
    }

    #[tokio::test]
    async fn test_recover_interrupts_recent_executions() {
        let client = ScriptedClient::new();
        let (orchestrator, store) = orchestrator_with(client.clone(), |c| {
            c.confirmation_timeout_ms = 60_000;
        });
        let id = paid_configuration(&orchestrator, &["base"]).await;

        // Crashed moments after claiming the record
        store
            .transition_configuration(id, ConfigurationStatus::Pending, ConfigurationStatus::Deploying)
            .await
            .unwrap();
        let base = store.get_record(id, "base").await.unwrap().unwrap();
        let claimed = base
            .begin_attempt(Utc::now() - chrono::Duration::milliseconds(500))
            .unwrap();
        assert!(store
            .compare_and_swap_record(DeploymentStatus::Pending, &claimed)
            .await
            .unwrap());

        assert_eq!(orchestrator.recover().await.unwrap(), 1);

        let base = store.get_record(id, "base").await.unwrap().unwrap();
        assert_eq!(base.status, DeploymentStatus::Failed);
        assert_eq!(base.last_error_category, Some(ChainErrorCategory::Timeout));
        assert_eq!(
            orchestrator.get_status(id).await.unwrap().configuration.status,
            ConfigurationStatus::Failed
        );

        orchestrator.retry_chain(id, "base").await.unwrap().wait().await.unwrap();

        let base = store.get_record(id, "base").await.unwrap().unwrap();
        assert_eq!(base.status, DeploymentStatus::Success);
        assert_eq!(base.attempt_count, 2);
        assert_eq!(client.submissions("base"), 1);
    }

    #[tokio::test]
    async fn test_sweep_expires_stalled_executions() {
        let client = ScriptedClient::new();
        let (orchestrator, store) = orchestrator(client.clone());
        let id = paid_configuration(&orchestrator, &["ethereum", "base"]).await;
        store
            .transition_configuration(id, ConfigurationStatus::Pending, ConfigurationStatus::Deploying)
            .await
            .unwrap();

        // Hub claimed long ago by a worker that is gone; peer still in its window
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        let hub = store.get_record(id, "ethereum").await.unwrap().unwrap();
        let stalled = hub
            .begin_attempt(long_ago)
            .and_then(|r| r.with_submission(&tx_hash(99), long_ago))
            .unwrap();
        assert!(store
            .compare_and_swap_record(DeploymentStatus::Pending, &stalled)
            .await
            .unwrap());
        let peer = store.get_record(id, "base").await.unwrap().unwrap();
        let running = peer.begin_attempt(Utc::now()).unwrap();
        assert!(store
            .compare_and_swap_record(DeploymentStatus::Pending, &running)
            .await
            .unwrap());

        client.mine_on_lookup();
        assert_eq!(orchestrator.reconcile().await.unwrap(), 1);

        let hub = store.get_record(id, "ethereum").await.unwrap().unwrap();
        assert_eq!(hub.status, DeploymentStatus::Success);
        assert!(hub.contract_address.is_some());
        assert_eq!(
            store.get_record(id, "base").await.unwrap().unwrap().status,
            DeploymentStatus::Deploying
        );
        assert_eq!(
            orchestrator.get_status(id).await.unwrap().configuration.status,
            ConfigurationStatus::Deploying
        );
        assert_eq!(client.submissions("ethereum"), 0);
    }
}
