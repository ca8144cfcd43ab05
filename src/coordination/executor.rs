//! Per-chain deployment execution

use super::engine::Orchestrator;
use super::reconcile::Reconciled;
use crate::error::{ChainError, DeployerError, DeployerResult};
use crate::model::{DeploymentRecord, DeploymentStatus, TokenConfiguration};

use chrono::Utc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Result of one deployment attempt
pub(super) enum AttemptOutcome {
    /// The record was not `pending` or another worker took it over
    Skipped,
    /// Confirmed; carries peers promoted to `link_pending`
    Succeeded(Vec<String>),
    /// Recorded as failed
    Failed {
        error: ChainError,
        record: DeploymentRecord,
    },
}

impl Orchestrator {
    /// Deploy `chain` until it succeeds or fails for good.
    ///
    /// Timeout and network failures are retried automatically until the
    /// record has used `max_auto_attempts` attempts. Returns the peers
    /// promoted to `link_pending` along the way.
    pub(super) async fn execute_deployment(
        &self,
        configuration: &TokenConfiguration,
        chain: &str,
    ) -> DeployerResult<Vec<String>> {
        loop {
            let (error, failed) = match self.attempt_deployment(configuration, chain).await? {
                AttemptOutcome::Skipped => return Ok(Vec::new()),
                AttemptOutcome::Succeeded(promoted) => return Ok(promoted),
                AttemptOutcome::Failed { error, record } => (error, record),
            };

            if !error.is_retryable() || failed.attempt_count >= self.config.max_auto_attempts {
                return Ok(Vec::new());
            }

            let delay = self.config.retry_delay(failed.attempt_count);
            debug!(
                "Retrying {} on chain {} in {:?} after {}",
                configuration.id, chain, delay, error
            );
            tokio::time::sleep(delay).await;
            if self.is_shutdown().await {
                return Ok(Vec::new());
            }

            // A timed-out submission may have been mined in the meantime
            match self.reconcile_record(&failed).await? {
                Reconciled::Recovered(promoted) => return Ok(promoted),
                Reconciled::Reverted => return Ok(Vec::new()),
                Reconciled::Unresolved => {}
            }

            let reset = failed.reset_for_retry(Utc::now())?;
            match self.settle(DeploymentStatus::Failed, &reset).await? {
                Some(promoted) if promoted.is_empty() => {}
                Some(promoted) => self.link_promoted(configuration, promoted).await,
                // A manual retry claimed the record and now drives it
                None => return Ok(Vec::new()),
            }
            crate::metrics::record_retry(chain, true);
        }
    }

    /// One `pending -> deploying -> success | failed` pass over a record
    pub(super) async fn attempt_deployment(
        &self,
        configuration: &TokenConfiguration,
        chain: &str,
    ) -> DeployerResult<AttemptOutcome> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| DeployerError::Internal(format!("transaction permits closed: {}", e)))?;

        let record = self
            .store
            .get_record(configuration.id, chain)
            .await?
            .ok_or_else(|| DeployerError::record_not_found(configuration.id, chain))?;
        if record.status != DeploymentStatus::Pending {
            debug!(
                "Skipping {} on chain {}: record is {}",
                configuration.id, chain, record.status
            );
            return Ok(AttemptOutcome::Skipped);
        }

        let started = record.begin_attempt(Utc::now())?;
        let mut promoted = match self.settle(DeploymentStatus::Pending, &started).await? {
            Some(promoted) => promoted,
            None => return Ok(AttemptOutcome::Skipped),
        };

        info!(
            "Deploying {} on chain {} (attempt {})",
            configuration.symbol, chain, started.attempt_count
        );
        crate::metrics::record_deployment_started(chain);

        let params = configuration.token_params();
        let submit_timeout = self.config.submit_timeout();
        let submitted_at = Instant::now();

        let tx_id = match timeout(submit_timeout, self.client.submit_deployment(chain, &params)).await
        {
            Ok(Ok(tx_id)) => tx_id,
            Ok(Err(error)) => return self.fail_attempt(&started, error).await,
            Err(_) => {
                let error =
                    ChainError::timeout(chain, "deployment submission", submit_timeout.as_secs());
                return self.fail_attempt(&started, error).await;
            }
        };

        let submitted = started.with_submission(&tx_id, Utc::now())?;
        match self.settle(DeploymentStatus::Deploying, &submitted).await? {
            Some(more) => promoted.extend(more),
            None => return Ok(AttemptOutcome::Skipped),
        }
        debug!("Deployment on chain {} submitted as {}", chain, tx_id);

        let confirmation_timeout = self.config.confirmation_timeout();
        let receipt = match timeout(
            confirmation_timeout,
            self.client.await_deployment(chain, &tx_id),
        )
        .await
        {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(error)) => return self.fail_attempt(&submitted, error).await,
            Err(_) => {
                let error = ChainError::timeout(
                    chain,
                    "deployment confirmation",
                    confirmation_timeout.as_secs(),
                );
                return self.fail_attempt(&submitted, error).await;
            }
        };

        let done = submitted.complete(&receipt.contract_address, &receipt.tx_id, Utc::now())?;
        match self.settle(DeploymentStatus::Deploying, &done).await? {
            Some(more) => promoted.extend(more),
            None => return Ok(AttemptOutcome::Skipped),
        }

        info!(
            "Deployed {} on chain {} at {}",
            configuration.symbol, chain, receipt.contract_address
        );
        crate::metrics::record_deployment_succeeded(chain, submitted_at.elapsed().as_secs_f64());

        Ok(AttemptOutcome::Succeeded(promoted))
    }

    async fn fail_attempt(
        &self,
        record: &DeploymentRecord,
        error: ChainError,
    ) -> DeployerResult<AttemptOutcome> {
        warn!(
            "Deployment of {} on chain {} failed (attempt {}): {}",
            record.configuration_id, record.chain_id, record.attempt_count, error
        );

        let failed = record.fail(&error, Utc::now())?;
        if self
            .settle(DeploymentStatus::Deploying, &failed)
            .await?
            .is_none()
        {
            return Ok(AttemptOutcome::Skipped);
        }
        crate::metrics::record_deployment_failed(&record.chain_id, error.category);

        Ok(AttemptOutcome::Failed {
            error,
            record: failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::error::ChainErrorCategory;
    use crate::model::{ConfigurationStatus, DeploymentStatus};
    use crate::state::DeploymentStore;

    #[tokio::test]
    async fn test_confirmation_timeout_is_recorded() {
        let client = ScriptedClient::new();
        client.hang_await("base");
        let (orchestrator, _) = orchestrator_with(client.clone(), |c| {
            c.confirmation_timeout_ms = 50;
            c.max_auto_attempts = 1;
        });
        let id = paid_configuration(&orchestrator, &["base"]).await;

        orchestrator.start_deployment(id).await.unwrap().wait().await.unwrap();

        let report = orchestrator.get_status(id).await.unwrap();
        let base = report.record("base").unwrap();
        assert_eq!(base.status, DeploymentStatus::Failed);
        assert_eq!(base.last_error_category, Some(ChainErrorCategory::Timeout));
        assert!(base.deployment_tx_id.is_some());
        assert!(base.contract_address.is_none());
        assert_eq!(report.configuration.status, ConfigurationStatus::Failed);
    }

    #[tokio::test]
    async fn test_submission_timeout_has_no_tx_id() {
        let client = ScriptedClient::new();
        client.hang_submit("base");
        let (orchestrator, _) = orchestrator_with(client, |c| {
            c.submit_timeout_ms = 50;
            c.max_auto_attempts = 1;
        });
        let id = paid_configuration(&orchestrator, &["base"]).await;

        orchestrator.start_deployment(id).await.unwrap().wait().await.unwrap();

        let base = orchestrator.get_status(id).await.unwrap().record("base").cloned().unwrap();
        assert_eq!(base.status, DeploymentStatus::Failed);
        assert_eq!(base.last_error_category, Some(ChainErrorCategory::Timeout));
        assert!(base.deployment_tx_id.is_none());
        assert!(!base.is_reconcilable());
    }

    #[tokio::test]
    async fn test_network_failures_retry_automatically() {
        let client = ScriptedClient::new();
        client.fail_submit("base", ChainErrorCategory::Network);
        client.fail_submit("base", ChainErrorCategory::Network);
        let (orchestrator, _) = orchestrator(client.clone());
        let id = paid_configuration(&orchestrator, &["base"]).await;

        orchestrator.start_deployment(id).await.unwrap().wait().await.unwrap();

        let report = orchestrator.get_status(id).await.unwrap();
        let base = report.record("base").unwrap();
        assert_eq!(base.status, DeploymentStatus::Success);
        assert_eq!(base.attempt_count, 3);
        assert_eq!(report.configuration.status, ConfigurationStatus::Completed);
        assert_eq!(client.submissions("base"), 3);
    }

    #[tokio::test]
    async fn test_automatic_retries_are_bounded() {
        let client = ScriptedClient::new();
        for _ in 0..5 {
            client.fail_submit("base", ChainErrorCategory::Network);
        }
        let (orchestrator, _) = orchestrator(client.clone());
        let id = paid_configuration(&orchestrator, &["base"]).await;

        orchestrator.start_deployment(id).await.unwrap().wait().await.unwrap();

        let base = orchestrator.get_status(id).await.unwrap().record("base").cloned().unwrap();
        assert_eq!(base.status, DeploymentStatus::Failed);
        assert_eq!(base.attempt_count, 3);
        assert_eq!(base.last_error_category, Some(ChainErrorCategory::Network));
        assert_eq!(client.submissions("base"), 3);
    }

    #[tokio::test]
    async fn test_timed_out_deployment_found_mined_before_resubmitting() {
        let client = ScriptedClient::new();
        client.fail_await("base", ChainErrorCategory::Timeout);
        client.mine_on_lookup();
        let (orchestrator, store) = orchestrator(client.clone());
        let id = paid_configuration(&orchestrator, &["base"]).await;

        orchestrator.start_deployment(id).await.unwrap().wait().await.unwrap();

        let base = store.get_record(id, "base").await.unwrap().unwrap();
        assert_eq!(base.status, DeploymentStatus::Success);
        assert_eq!(base.attempt_count, 1);
        assert!(base.contract_address.is_some());
        assert_eq!(client.submissions("base"), 1);
    }

    #[tokio::test]
    async fn test_reverted_failure_is_not_retried() {
        let client = ScriptedClient::new();
        client.fail_await("base", ChainErrorCategory::Reverted);
        let (orchestrator, _) = orchestrator(client.clone());
        let id = paid_configuration(&orchestrator, &["base"]).await;

        orchestrator.start_deployment(id).await.unwrap().wait().await.unwrap();

        let base = orchestrator.get_status(id).await.unwrap().record("base").cloned().unwrap();
        assert_eq!(base.status, DeploymentStatus::Failed);
        assert_eq!(base.attempt_count, 1);
        assert_eq!(client.submissions("base"), 1);
    }
}
