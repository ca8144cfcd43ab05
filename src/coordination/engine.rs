//! Orchestrator entry points and status settling

use crate::chain::{ChainDeploymentClient, ChainRegistry};
use crate::config::OrchestratorConfig;
use crate::error::{DeployerError, DeployerResult};
use crate::locks::KeyedLocks;
use crate::model::{
    is_tx_hash, summarize_failures, ConfigurationStatus, DeploymentRecord,
    DeploymentStatus, DeploymentStatusReport, NewTokenConfiguration, TokenConfiguration,
};
use crate::state::{DeploymentStats, DeploymentStore};

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Background execution started by `start_deployment` or `retry_chain`
pub struct DeploymentHandle {
    task: JoinHandle<()>,
}

impl DeploymentHandle {
    /// Wait until the execution has settled every record it touched
    pub async fn wait(self) -> DeployerResult<()> {
        self.task
            .await
            .map_err(|e| DeployerError::Internal(format!("deployment task failed: {}", e)))
    }
}

/// Multi-chain deployment orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    /// Durable configurations and records
    pub(super) store: Arc<dyn DeploymentStore>,
    /// Chain access
    pub(super) client: Arc<dyn ChainDeploymentClient>,
    /// Enabled chains and the hub
    pub(super) registry: Arc<ChainRegistry>,
    pub(super) config: Arc<OrchestratorConfig>,
    /// Serializes record writes, promotion and aggregation per configuration
    settle_locks: Arc<KeyedLocks<Uuid>>,
    /// One ownership hand-over at a time per configuration
    pub(super) handover_locks: Arc<KeyedLocks<Uuid>>,
    /// Bounds chain calls in flight
    pub(super) permits: Arc<Semaphore>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        client: Arc<dyn ChainDeploymentClient>,
        registry: Arc<ChainRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_txs.max(1)));

        Self {
            store,
            client,
            registry,
            config: Arc::new(config),
            settle_locks: Arc::new(KeyedLocks::new()),
            handover_locks: Arc::new(KeyedLocks::new()),
            permits,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Validate and persist a configuration with one pending record per chain
    pub async fn create_configuration(
        &self,
        draft: NewTokenConfiguration,
    ) -> DeployerResult<TokenConfiguration> {
        draft.validate(&self.registry)?;

        let configuration = TokenConfiguration::new(draft);
        let records = configuration
            .chains
            .iter()
            .map(|chain| {
                let info = self.registry.get(chain)?;
                Ok(DeploymentRecord::new(
                    configuration.id,
                    chain.clone(),
                    info.name.clone(),
                    self.registry.requires_link(&configuration.chains, chain),
                ))
            })
            .collect::<DeployerResult<Vec<_>>>()?;

        self.store
            .insert_configuration(&configuration, &records)
            .await?;

        info!(
            "Created configuration {} for {} on {} chains",
            configuration.id,
            configuration.symbol,
            records.len()
        );
        Ok(configuration)
    }

    /// Attach the fee payment transaction that authorizes deployment
    pub async fn attach_fee_payment(
        &self,
        id: Uuid,
        fee_payment_ref: &str,
    ) -> DeployerResult<TokenConfiguration> {
        if !is_tx_hash(fee_payment_ref) {
            return Err(DeployerError::Validation(format!(
                "fee payment reference {:?} is not a transaction hash",
                fee_payment_ref
            )));
        }

        let configuration = self.load_configuration(id).await?;
        match configuration.fee_payment_ref.as_deref() {
            Some(existing) if existing == fee_payment_ref => return Ok(configuration),
            Some(existing) => {
                return Err(DeployerError::InvalidState(format!(
                    "configuration {} already paid with {}",
                    id, existing
                )))
            }
            None => {}
        }
        if configuration.status != ConfigurationStatus::Pending {
            return Err(DeployerError::InvalidState(format!(
                "configuration {} is {}",
                id, configuration.status
            )));
        }

        if !self.store.attach_fee_payment(id, fee_payment_ref).await? {
            // Lost a race; accept it only if the winner used the same reference
            let current = self.load_configuration(id).await?;
            if current.fee_payment_ref.as_deref() != Some(fee_payment_ref) {
                return Err(DeployerError::InvalidState(format!(
                    "configuration {} already has a fee payment",
                    id
                )));
            }
            return Ok(current);
        }

        debug!("Fee payment {} attached to {}", fee_payment_ref, id);
        self.load_configuration(id).await
    }

    /// Move a paid configuration to `deploying` and execute it in the background
    pub async fn start_deployment(&self, id: Uuid) -> DeployerResult<DeploymentHandle> {
        let configuration = self.load_configuration(id).await?;

        if !configuration.has_fee_payment() {
            return Err(DeployerError::InvalidState(format!(
                "configuration {} has no fee payment",
                id
            )));
        }
        if configuration.status != ConfigurationStatus::Pending {
            return Err(DeployerError::InvalidState(format!(
                "configuration {} is already {}",
                id, configuration.status
            )));
        }

        let started = self
            .store
            .transition_configuration(id, ConfigurationStatus::Pending, ConfigurationStatus::Deploying)
            .await?;
        if !started {
            return Err(DeployerError::InvalidState(format!(
                "configuration {} was started concurrently",
                id
            )));
        }

        info!(
            "Starting deployment of {} on {:?}",
            configuration.symbol, configuration.chains
        );
        Ok(self.spawn_configuration(id))
    }

    /// Aggregate status with every child record
    pub async fn get_status(&self, id: Uuid) -> DeployerResult<DeploymentStatusReport> {
        let configuration = self.load_configuration(id).await?;
        let records = self.store.list_records(id).await?;
        Ok(DeploymentStatusReport {
            configuration,
            records,
        })
    }

    /// Reset a failed chain and execute it again.
    ///
    /// Only `failed` and `link_failed` records can be retried; anything else,
    /// including a record another retry just claimed, is `InvalidState`.
    pub async fn retry_chain(&self, id: Uuid, chain: &str) -> DeployerResult<DeploymentHandle> {
        let configuration = self.load_configuration(id).await?;
        if configuration.status == ConfigurationStatus::Pending {
            return Err(DeployerError::InvalidState(format!(
                "configuration {} has not been started",
                id
            )));
        }

        let record = self
            .store
            .get_record(id, chain)
            .await?
            .ok_or_else(|| DeployerError::record_not_found(id, chain))?;

        let reset = record.reset_for_retry(Utc::now())?;
        let promoted = match self.settle(record.status, &reset).await? {
            Some(promoted) => promoted,
            None => {
                return Err(DeployerError::InvalidState(format!(
                    "chain {} of {} is already being retried",
                    chain, id
                )))
            }
        };

        info!(
            "Retrying {} on chain {} (was {}, {} attempts so far)",
            id, chain, record.status, record.attempt_count
        );
        crate::metrics::record_retry(chain, false);

        let this = self.clone();
        let chain = chain.to_string();
        let task = tokio::spawn(async move {
            let result = match reset.status {
                DeploymentStatus::LinkPending => this.link_peer(&configuration, &chain).await,
                _ => this.run_chain(&configuration, &chain).await,
            };
            if let Err(e) = result {
                error!("Retry of {} on chain {} failed: {}", id, chain, e);
            }
            this.link_promoted(&configuration, promoted).await;
            if let Err(e) = this.hand_over_ownership(id).await {
                error!("Ownership hand-over of {} failed: {}", id, e);
            }
        });

        Ok(DeploymentHandle { task })
    }

    /// Periodic reconciliation loop
    pub async fn run(&self) -> DeployerResult<()> {
        let mut reconcile_interval =
            interval(Duration::from_secs(self.config.reconcile_interval_secs.max(1)));
        let mut shutdown_check = interval(Duration::from_secs(1));

        info!("Orchestrator started");

        loop {
            if self.is_shutdown().await {
                break;
            }

            tokio::select! {
                _ = reconcile_interval.tick() => {
                    match self.reconcile().await {
                        Ok(0) => {}
                        Ok(n) => info!("Reconciliation recovered {} deployments", n),
                        Err(e) => error!("Reconciliation sweep failed: {}", e),
                    }
                    match self.hand_over_pending().await {
                        Ok(0) => {}
                        Ok(n) => info!("Handed {} contracts over to their creators", n),
                        Err(e) => error!("Ownership sweep failed: {}", e),
                    }
                }

                _ = shutdown_check.tick() => {}
            }
        }

        info!("Orchestrator stopped");
        Ok(())
    }

    /// Stop the orchestrator
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Orchestrator shutdown initiated");
    }

    pub(super) async fn is_shutdown(&self) -> bool {
        *self.shutdown.read().await
    }

    pub async fn health_check(&self) -> DeployerResult<()> {
        self.store.health_check().await
    }

    pub async fn stats(&self) -> DeployerResult<DeploymentStats> {
        self.store.get_stats().await
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    pub(super) async fn load_configuration(&self, id: Uuid) -> DeployerResult<TokenConfiguration> {
        self.store
            .get_configuration(id)
            .await?
            .ok_or_else(|| DeployerError::configuration_not_found(id))
    }

    pub(super) fn spawn_configuration(&self, id: Uuid) -> DeploymentHandle {
        let this = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = this.execute_configuration(id).await {
                error!("Deployment of configuration {} stopped: {}", id, e);
            }
        });

        DeploymentHandle { task }
    }

    /// Drive every outstanding record of a configuration to a terminal state
    async fn execute_configuration(&self, id: Uuid) -> DeployerResult<()> {
        let configuration = self.load_configuration(id).await?;
        self.refresh(id).await?;

        let records = self.store.list_records(id).await?;
        let deployments = records
            .iter()
            .filter(|r| r.status == DeploymentStatus::Pending)
            .map(|r| self.run_chain(&configuration, &r.chain_id));
        let links = records
            .iter()
            .filter(|r| r.status == DeploymentStatus::LinkPending)
            .map(|r| self.link_peer(&configuration, &r.chain_id));

        let (deployed, linked) = futures::join!(join_all(deployments), join_all(links));
        for result in deployed.into_iter().chain(linked) {
            if let Err(e) = result {
                error!("Configuration {}: {}", id, e);
            }
        }

        let report = self.get_status(id).await?;
        info!(
            "Configuration {} settled as {}",
            id, report.configuration.status
        );

        self.hand_over_ownership(id).await?;
        Ok(())
    }

    /// Deploy one chain, then link every peer the deployment made linkable
    pub(super) async fn run_chain(
        &self,
        configuration: &TokenConfiguration,
        chain: &str,
    ) -> DeployerResult<()> {
        let promoted = self.execute_deployment(configuration, chain).await?;
        self.link_promoted(configuration, promoted).await;
        Ok(())
    }

    pub(super) async fn link_promoted(
        &self,
        configuration: &TokenConfiguration,
        promoted: Vec<String>,
    ) {
        let links = promoted
            .iter()
            .map(|peer| self.link_peer(configuration, peer));
        for (peer, result) in promoted.iter().zip(join_all(links).await) {
            if let Err(e) = result {
                error!(
                    "Linking {} on chain {} stopped: {}",
                    configuration.id, peer, e
                );
            }
        }
    }

    /// Persist a record change and bring the configuration in step with it.
    ///
    /// Returns `None` when the stored record no longer has `expected` status;
    /// otherwise the peers this change promoted to `link_pending`. The caller
    /// that receives a promoted peer is responsible for linking it.
    pub(super) async fn settle(
        &self,
        expected: DeploymentStatus,
        record: &DeploymentRecord,
    ) -> DeployerResult<Option<Vec<String>>> {
        let _guard = self.settle_locks.acquire(&record.configuration_id).await;

        if !self.store.compare_and_swap_record(expected, record).await? {
            debug!(
                "Record {}/{} moved on from {}, dropping write",
                record.configuration_id, record.chain_id, expected
            );
            return Ok(None);
        }

        self.promote_and_aggregate(record.configuration_id)
            .await
            .map(Some)
    }

    /// Promotion and aggregation without a record write
    pub(super) async fn refresh(&self, id: Uuid) -> DeployerResult<Vec<String>> {
        let _guard = self.settle_locks.acquire(&id).await;
        self.promote_and_aggregate(id).await
    }

    /// Caller must hold the settle lock of `id`
    async fn promote_and_aggregate(&self, id: Uuid) -> DeployerResult<Vec<String>> {
        let configuration = self.load_configuration(id).await?;
        let mut records = self.store.list_records(id).await?;
        let mut promoted = Vec::new();

        let hub_deployed = self
            .registry
            .hub_in(&configuration.chains)
            .and_then(|hub| records.iter().find(|r| r.chain_id == hub))
            .map(|hub| hub.status.is_success())
            .unwrap_or(false);

        if hub_deployed {
            let now = Utc::now();
            for record in records.iter_mut() {
                if !record.requires_link || record.status != DeploymentStatus::Success {
                    continue;
                }
                let linkable = record.promote_to_link(now)?;
                if self
                    .store
                    .compare_and_swap_record(DeploymentStatus::Success, &linkable)
                    .await?
                {
                    debug!("Chain {} of {} ready for linking", record.chain_id, id);
                    promoted.push(record.chain_id.clone());
                    *record = linkable;
                }
            }
        }

        // Nothing runs before start; the aggregate stays pending until then
        if configuration.status == ConfigurationStatus::Pending {
            return Ok(promoted);
        }

        let status = ConfigurationStatus::aggregate(records.iter().map(|r| r.status));
        let error = summarize_failures(&records);

        if status != configuration.status || error != configuration.error {
            self.store
                .update_aggregate(id, status, error.as_deref())
                .await?;

            if status != configuration.status {
                debug!(
                    "Configuration {} aggregate {} -> {}",
                    id, configuration.status, status
                );
                if status.is_terminal() {
                    crate::metrics::record_configuration_settled(status);
                    match status {
                        ConfigurationStatus::Completed => info!("Configuration {} completed", id),
                        _ => warn!(
                            "Configuration {} finished {}: {}",
                            id,
                            status,
                            error.as_deref().unwrap_or("no error recorded")
                        ),
                    }
                }
            }
        }

        Ok(promoted)
    }
}
