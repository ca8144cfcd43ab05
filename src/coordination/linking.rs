//! Hub/peer linking

use super::engine::Orchestrator;
use crate::error::{ChainError, DeployerError, DeployerResult};
use crate::model::{DeploymentRecord, DeploymentStatus, LinkDirection, TokenConfiguration};

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

impl Orchestrator {
    /// Link a `link_pending` peer with the hub chain.
    ///
    /// Registers the peer on the hub and the hub on the peer concurrently. A
    /// direction whose transaction is already recorded is not sent again.
    /// Transient failures are retried up to `max_auto_attempts`.
    pub(super) async fn link_peer(
        &self,
        configuration: &TokenConfiguration,
        peer: &str,
    ) -> DeployerResult<()> {
        let hub = self
            .registry
            .hub_in(&configuration.chains)
            .ok_or_else(|| {
                DeployerError::InvalidState(format!(
                    "configuration {} has no hub chain to link {} with",
                    configuration.id, peer
                ))
            })?
            .to_string();

        let hub_address = self
            .store
            .get_record(configuration.id, &hub)
            .await?
            .and_then(|r| r.contract_address)
            .ok_or_else(|| {
                DeployerError::InvalidState(format!(
                    "hub chain {} of {} has no deployed contract",
                    hub, configuration.id
                ))
            })?;

        loop {
            let (error, failed) = match self
                .attempt_link(configuration, &hub, &hub_address, peer)
                .await?
            {
                None => return Ok(()),
                Some(failure) => failure,
            };

            if !error.is_retryable() || failed.link_attempt_count >= self.config.max_auto_attempts {
                return Ok(());
            }

            tokio::time::sleep(self.config.retry_delay(failed.link_attempt_count)).await;
            if self.is_shutdown().await {
                return Ok(());
            }

            let reset = failed.reset_for_retry(Utc::now())?;
            if self
                .settle(DeploymentStatus::LinkFailed, &reset)
                .await?
                .is_none()
            {
                return Ok(());
            }
            crate::metrics::record_retry(peer, true);
        }
    }

    /// One `link_pending -> link_deploying -> link_success | link_failed` pass.
    /// Returns the failure and the failed record, `None` otherwise.
    async fn attempt_link(
        &self,
        configuration: &TokenConfiguration,
        hub: &str,
        hub_address: &str,
        peer: &str,
    ) -> DeployerResult<Option<(ChainError, DeploymentRecord)>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| DeployerError::Internal(format!("transaction permits closed: {}", e)))?;

        let record = self
            .store
            .get_record(configuration.id, peer)
            .await?
            .ok_or_else(|| DeployerError::record_not_found(configuration.id, peer))?;
        if record.status != DeploymentStatus::LinkPending {
            debug!(
                "Skipping link of {} on chain {}: record is {}",
                configuration.id, peer, record.status
            );
            return Ok(None);
        }

        let peer_address = record.contract_address.clone().ok_or_else(|| {
            DeployerError::InvalidState(format!(
                "chain {} of {} is linkable without a contract address",
                peer, configuration.id
            ))
        })?;

        let linking = record.begin_link(Utc::now())?;
        if self
            .settle(DeploymentStatus::LinkPending, &linking)
            .await?
            .is_none()
        {
            return Ok(None);
        }

        info!(
            "Linking {} on chain {} with hub {} (attempt {})",
            configuration.symbol, peer, hub, linking.link_attempt_count
        );

        let hub_to_peer = async {
            match linking.link_tx(LinkDirection::HubToPeer) {
                Some(tx_id) => Ok(tx_id.to_string()),
                None => self.register(hub, hub_address, peer, &peer_address).await,
            }
        };
        let peer_to_hub = async {
            match linking.link_tx(LinkDirection::PeerToHub) {
                Some(tx_id) => Ok(tx_id.to_string()),
                None => self.register(peer, &peer_address, hub, hub_address).await,
            }
        };
        let (hub_to_peer, peer_to_hub) = tokio::join!(hub_to_peer, peer_to_hub);

        // Keep every confirmed direction so a retry only resends the other
        let mut current = linking.clone();
        let mut failure = None;
        for (direction, result) in [
            (LinkDirection::HubToPeer, hub_to_peer),
            (LinkDirection::PeerToHub, peer_to_hub),
        ] {
            match result {
                Ok(tx_id) if current.link_tx(direction) != Some(tx_id.as_str()) => {
                    let updated = current.with_link_tx(direction, &tx_id, Utc::now())?;
                    if self
                        .settle(DeploymentStatus::LinkDeploying, &updated)
                        .await?
                        .is_none()
                    {
                        return Ok(None);
                    }
                    current = updated;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        "Link {} for {} on chain {} failed: {}",
                        direction.as_str(),
                        configuration.id,
                        peer,
                        error
                    );
                    failure.get_or_insert(error);
                }
            }
        }

        match failure {
            None => {
                let linked = current.complete_link(Utc::now())?;
                if self
                    .settle(DeploymentStatus::LinkDeploying, &linked)
                    .await?
                    .is_some()
                {
                    info!("Linked {} on chain {} with hub {}", configuration.symbol, peer, hub);
                    crate::metrics::record_link_succeeded(peer);
                }
                Ok(None)
            }
            Some(error) => {
                let failed = current.fail_link(&error, Utc::now())?;
                if self
                    .settle(DeploymentStatus::LinkDeploying, &failed)
                    .await?
                    .is_none()
                {
                    return Ok(None);
                }
                crate::metrics::record_link_failed(peer, error.category);
                Ok(Some((error, failed)))
            }
        }
    }

    /// Register `remote_address` as the peer of `local_address`, bounded by the link timeout
    async fn register(
        &self,
        chain: &str,
        local_address: &str,
        remote_chain: &str,
        remote_address: &str,
    ) -> Result<String, ChainError> {
        let link_timeout = self.config.link_timeout();
        match timeout(
            link_timeout,
            self.client
                .register_peer(chain, local_address, remote_chain, remote_address),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChainError::timeout(
                chain,
                "peer registration",
                link_timeout.as_secs(),
            )),
        }
    }
}
