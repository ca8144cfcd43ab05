//! Durable storage for token configurations and deployment records
//!
//! Handles:
//! - Configuration and record persistence
//! - Compare-and-swap record writes keyed on the expected status
//! - Aggregate status updates
//! - Queries used by recovery and reconciliation

mod manager;
mod memory;

pub use manager::PgStateManager;
pub use memory::MemoryStore;

use crate::error::DeployerResult;
use crate::model::{ConfigurationStatus, DeploymentRecord, DeploymentStatus, TokenConfiguration};

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

/// Storage seam used by the orchestrator.
///
/// Record writes are compare-and-swap on status: an update succeeds only when
/// the stored record still has `expected` status, and never replaces a
/// contract address that is already set.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn health_check(&self) -> DeployerResult<()>;

    /// Insert a configuration together with its initial records
    async fn insert_configuration(
        &self,
        configuration: &TokenConfiguration,
        records: &[DeploymentRecord],
    ) -> DeployerResult<()>;

    async fn get_configuration(&self, id: Uuid) -> DeployerResult<Option<TokenConfiguration>>;

    async fn list_configurations_by_status(
        &self,
        status: ConfigurationStatus,
    ) -> DeployerResult<Vec<TokenConfiguration>>;

    /// Set the fee payment reference if none is set; false when one already is
    async fn attach_fee_payment(&self, id: Uuid, fee_payment_ref: &str) -> DeployerResult<bool>;

    /// Move a configuration from `expected` to `next`; false if it was not `expected`
    async fn transition_configuration(
        &self,
        id: Uuid,
        expected: ConfigurationStatus,
        next: ConfigurationStatus,
    ) -> DeployerResult<bool>;

    /// Overwrite the aggregate status and error text
    async fn update_aggregate(
        &self,
        id: Uuid,
        status: ConfigurationStatus,
        error: Option<&str>,
    ) -> DeployerResult<()>;

    async fn get_record(
        &self,
        configuration_id: Uuid,
        chain_id: &str,
    ) -> DeployerResult<Option<DeploymentRecord>>;

    /// All records of a configuration, ordered by chain key
    async fn list_records(&self, configuration_id: Uuid) -> DeployerResult<Vec<DeploymentRecord>>;

    /// Replace the stored record if its status is still `expected`
    async fn compare_and_swap_record(
        &self,
        expected: DeploymentStatus,
        record: &DeploymentRecord,
    ) -> DeployerResult<bool>;

    async fn list_records_by_status(
        &self,
        statuses: &[DeploymentStatus],
    ) -> DeployerResult<Vec<DeploymentRecord>>;

    /// Records of completed configurations whose ownership is not handed over yet
    async fn list_ownership_pending(&self) -> DeployerResult<Vec<DeploymentRecord>>;

    async fn get_stats(&self) -> DeployerResult<DeploymentStats>;
}

/// Record and configuration counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentStats {
    pub configurations: u64,
    pub pending: u64,
    pub deploying: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub linking: u64,
    pub linked: u64,
    pub link_failed: u64,
}

impl DeploymentStats {
    /// Add `n` records with `status` to the matching bucket
    pub fn add(&mut self, status: DeploymentStatus, n: u64) {
        let bucket = match status {
            DeploymentStatus::Pending => &mut self.pending,
            DeploymentStatus::Deploying => &mut self.deploying,
            DeploymentStatus::Success => &mut self.succeeded,
            DeploymentStatus::Failed => &mut self.failed,
            DeploymentStatus::LinkPending | DeploymentStatus::LinkDeploying => &mut self.linking,
            DeploymentStatus::LinkSuccess => &mut self.linked,
            DeploymentStatus::LinkFailed => &mut self.link_failed,
        };
        *bucket += n;
    }
}
