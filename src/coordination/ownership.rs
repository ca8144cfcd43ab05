//! Contract ownership hand-over
//!
//! Contracts are deployed owned by the deployer wallet so it can register
//! peers. Once a configuration completes, every contract is handed to the
//! creator. Partial configurations keep the deployer as owner so retried
//! chains can still be linked.

use super::engine::Orchestrator;
use crate::error::{DeployerError, DeployerResult};
use crate::model::{ConfigurationStatus, DeploymentRecord, TokenConfiguration};

use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Orchestrator {
    /// Transfer every contract of a completed configuration to its creator.
    /// Returns the number of contracts handed over.
    pub(super) async fn hand_over_ownership(&self, id: Uuid) -> DeployerResult<usize> {
        let _guard = self.handover_locks.acquire(&id).await;

        let configuration = self.load_configuration(id).await?;
        if configuration.status != ConfigurationStatus::Completed {
            return Ok(0);
        }

        let pending: Vec<_> = self
            .store
            .list_records(id)
            .await?
            .into_iter()
            .filter(DeploymentRecord::awaits_ownership_transfer)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(
            "Handing {} contracts of {} over to {}",
            pending.len(),
            id,
            configuration.creator
        );

        let transfers = pending
            .iter()
            .map(|record| self.transfer_record(&configuration, record));
        let transferred = join_all(transfers)
            .await
            .into_iter()
            .collect::<DeployerResult<Vec<bool>>>()?;

        Ok(transferred.into_iter().filter(|done| *done).count())
    }

    /// Sweep completed configurations whose hand-over failed or never ran
    pub async fn hand_over_pending(&self) -> DeployerResult<usize> {
        let ids: BTreeSet<Uuid> = self
            .store
            .list_ownership_pending()
            .await?
            .into_iter()
            .map(|record| record.configuration_id)
            .collect();

        let mut transferred = 0;
        for id in ids {
            transferred += self.hand_over_ownership(id).await?;
        }
        Ok(transferred)
    }

    /// Chain failures are logged and left for the next sweep
    async fn transfer_record(
        &self,
        configuration: &TokenConfiguration,
        record: &DeploymentRecord,
    ) -> DeployerResult<bool> {
        let Some(contract_address) = record.contract_address.as_deref() else {
            return Ok(false);
        };
        let chain = record.chain_id.as_str();

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| DeployerError::Internal(format!("transaction permits closed: {}", e)))?;

        let link_timeout = self.config.link_timeout();
        let transfer = timeout(
            link_timeout,
            self.client
                .transfer_ownership(chain, contract_address, &configuration.creator),
        )
        .await;

        let tx_id = match transfer {
            Ok(Ok(tx_id)) => tx_id,
            Ok(Err(error)) => {
                warn!(
                    "Ownership transfer of {} on chain {} failed: {}",
                    contract_address, chain, error
                );
                return Ok(false);
            }
            Err(_) => {
                warn!(
                    "Ownership transfer of {} on chain {} timed out after {:?}",
                    contract_address, chain, link_timeout
                );
                return Ok(false);
            }
        };

        let handed_over = record.with_ownership_transfer(&tx_id, Utc::now())?;
        if self.settle(record.status, &handed_over).await?.is_none() {
            return Ok(false);
        }

        info!(
            "Contract {} on chain {} now owned by {}",
            contract_address, chain, configuration.creator
        );
        crate::metrics::record_ownership_transferred(chain);
        Ok(true)
    }
}
