//! In-memory store
//!
//! Non-durable; used by tests and by `memory://` development setups.

use super::{DeploymentStats, DeploymentStore};
use crate::error::{DeployerError, DeployerResult};
use crate::model::{ConfigurationStatus, DeploymentRecord, DeploymentStatus, TokenConfiguration};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

type RecordKey = (Uuid, String);

#[derive(Debug, Default)]
pub struct MemoryStore {
    configurations: Arc<RwLock<HashMap<Uuid, TokenConfiguration>>>,
    // BTreeMap keeps records of one configuration ordered by chain key
    records: Arc<RwLock<BTreeMap<RecordKey, DeploymentRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn health_check(&self) -> DeployerResult<()> {
        Ok(())
    }

    async fn insert_configuration(
        &self,
        configuration: &TokenConfiguration,
        records: &[DeploymentRecord],
    ) -> DeployerResult<()> {
        let mut configurations = self.configurations.write().await;
        let mut stored = self.records.write().await;

        if configurations.contains_key(&configuration.id) {
            return Err(DeployerError::InvalidState(format!(
                "configuration {} already exists",
                configuration.id
            )));
        }

        configurations.insert(configuration.id, configuration.clone());
        for record in records {
            stored.insert(
                (record.configuration_id, record.chain_id.clone()),
                record.clone(),
            );
        }
        Ok(())
    }

    async fn get_configuration(&self, id: Uuid) -> DeployerResult<Option<TokenConfiguration>> {
        Ok(self.configurations.read().await.get(&id).cloned())
    }

    async fn list_configurations_by_status(
        &self,
        status: ConfigurationStatus,
    ) -> DeployerResult<Vec<TokenConfiguration>> {
        let mut matching: Vec<_> = self
            .configurations
            .read()
            .await
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|c| c.created_at);
        Ok(matching)
    }

    async fn attach_fee_payment(&self, id: Uuid, fee_payment_ref: &str) -> DeployerResult<bool> {
        let mut configurations = self.configurations.write().await;
        let configuration = configurations
            .get_mut(&id)
            .ok_or_else(|| DeployerError::configuration_not_found(id))?;

        if configuration.fee_payment_ref.is_some() {
            return Ok(false);
        }
        configuration.fee_payment_ref = Some(fee_payment_ref.to_string());
        configuration.updated_at = Utc::now();
        Ok(true)
    }

    async fn transition_configuration(
        &self,
        id: Uuid,
        expected: ConfigurationStatus,
        next: ConfigurationStatus,
    ) -> DeployerResult<bool> {
        let mut configurations = self.configurations.write().await;
        match configurations.get_mut(&id) {
            Some(configuration) if configuration.status == expected => {
                configuration.status = next;
                configuration.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(DeployerError::configuration_not_found(id)),
        }
    }

    async fn update_aggregate(
        &self,
        id: Uuid,
        status: ConfigurationStatus,
        error: Option<&str>,
    ) -> DeployerResult<()> {
        let mut configurations = self.configurations.write().await;
        let configuration = configurations
            .get_mut(&id)
            .ok_or_else(|| DeployerError::configuration_not_found(id))?;

        configuration.status = status;
        configuration.error = error.map(str::to_string);
        configuration.updated_at = Utc::now();
        Ok(())
    }

    async fn get_record(
        &self,
        configuration_id: Uuid,
        chain_id: &str,
    ) -> DeployerResult<Option<DeploymentRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(configuration_id, chain_id.to_string()))
            .cloned())
    }

    async fn list_records(&self, configuration_id: Uuid) -> DeployerResult<Vec<DeploymentRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.configuration_id == configuration_id)
            .cloned()
            .collect())
    }

    async fn compare_and_swap_record(
        &self,
        expected: DeploymentStatus,
        record: &DeploymentRecord,
    ) -> DeployerResult<bool> {
        let mut records = self.records.write().await;
        let key = (record.configuration_id, record.chain_id.clone());
        let stored = records
            .get_mut(&key)
            .ok_or_else(|| DeployerError::record_not_found(record.configuration_id, &record.chain_id))?;

        if stored.status != expected {
            return Ok(false);
        }

        if let Some(existing) = &stored.contract_address {
            if record.contract_address.as_ref() != Some(existing) {
                return Err(DeployerError::ContractAddressConflict {
                    chain: record.chain_id.clone(),
                    existing: existing.clone(),
                });
            }
        }

        // Ownership is handed over once, like the contract address
        let ownership_tx_id = stored
            .ownership_tx_id
            .take()
            .or_else(|| record.ownership_tx_id.clone());
        *stored = record.clone();
        stored.ownership_tx_id = ownership_tx_id;
        Ok(true)
    }

    async fn list_records_by_status(
        &self,
        statuses: &[DeploymentStatus],
    ) -> DeployerResult<Vec<DeploymentRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn list_ownership_pending(&self) -> DeployerResult<Vec<DeploymentRecord>> {
        let configurations = self.configurations.read().await;
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.awaits_ownership_transfer())
            .filter(|r| {
                configurations
                    .get(&r.configuration_id)
                    .map(|c| c.status == ConfigurationStatus::Completed)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn get_stats(&self) -> DeployerResult<DeploymentStats> {
        let mut stats = DeploymentStats {
            configurations: self.configurations.read().await.len() as u64,
            ..DeploymentStats::default()
        };
        for record in self.records.read().await.values() {
            stats.add(record.status, 1);
        }
        Ok(stats)
    }
}
