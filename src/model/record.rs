//! Token configurations and per-chain deployment records

use super::status::{ConfigurationStatus, DeploymentStatus, LinkStatus};
use crate::chain::ChainRegistry;
use crate::error::{ChainError, ChainErrorCategory, DeployerError, DeployerResult};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Highest number of decimals a deployed token may use
pub const MAX_DECIMALS: u8 = 18;

lazy_static! {
    static ref EVM_ADDRESS: Regex = Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap();
    static ref TX_HASH: Regex = Regex::new(r"^0x[0-9a-fA-F]{64}$").unwrap();
    static ref SYMBOL: Regex = Regex::new(r"^[A-Za-z0-9]{1,11}$").unwrap();
    static ref DIGITS: Regex = Regex::new(r"^[0-9]+$").unwrap();
}

pub fn is_evm_address(value: &str) -> bool {
    EVM_ADDRESS.is_match(value)
}

pub fn is_tx_hash(value: &str) -> bool {
    TX_HASH.is_match(value)
}

/// Token parameters handed to the chain client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenParams {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    /// Base-unit supply as a decimal integer string
    pub total_supply: String,
    /// Receives the initial supply; ownership follows once linking is done
    pub holder: String,
}

/// User input for a new token configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NewTokenConfiguration {
    pub creator: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: String,
    pub icon: Option<String>,
    pub chains: Vec<String>,
}

impl NewTokenConfiguration {
    /// Reject bad input before anything is persisted
    pub fn validate(&self, registry: &ChainRegistry) -> DeployerResult<()> {
        if !is_evm_address(&self.creator) {
            return Err(DeployerError::Validation(format!(
                "creator {:?} is not a wallet address",
                self.creator
            )));
        }

        let name = self.name.trim();
        if name.is_empty() || name.len() > 64 {
            return Err(DeployerError::Validation(
                "name must be between 1 and 64 characters".to_string(),
            ));
        }

        if !SYMBOL.is_match(&self.symbol) {
            return Err(DeployerError::Validation(format!(
                "symbol {:?} must be 1-11 alphanumeric characters",
                self.symbol
            )));
        }

        if self.decimals > MAX_DECIMALS {
            return Err(DeployerError::Validation(format!(
                "decimals must be at most {}, got {}",
                MAX_DECIMALS, self.decimals
            )));
        }

        if !DIGITS.is_match(&self.total_supply) {
            return Err(DeployerError::Validation(format!(
                "total supply {:?} is not a decimal integer",
                self.total_supply
            )));
        }
        let supply = U256::from_dec_str(&self.total_supply).map_err(|_| {
            DeployerError::Validation("total supply does not fit in 256 bits".to_string())
        })?;
        if supply.is_zero() {
            return Err(DeployerError::Validation(
                "total supply must be greater than zero".to_string(),
            ));
        }

        if self.chains.is_empty() {
            return Err(DeployerError::Validation(
                "at least one chain must be selected".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.as_str()) {
                return Err(DeployerError::Validation(format!(
                    "chain {} selected more than once",
                    chain
                )));
            }
            if !registry.contains(chain) {
                return Err(DeployerError::Validation(format!(
                    "chain {} is not available for deployment",
                    chain
                )));
            }
        }

        Ok(())
    }
}

/// A token requested once and deployed on every selected chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfiguration {
    pub id: Uuid,
    pub creator: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: String,
    pub icon: Option<String>,
    pub chains: Vec<String>,
    pub fee_payment_ref: Option<String>,
    pub status: ConfigurationStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenConfiguration {
    pub fn new(draft: NewTokenConfiguration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            creator: draft.creator,
            name: draft.name.trim().to_string(),
            symbol: draft.symbol,
            decimals: draft.decimals,
            total_supply: draft.total_supply,
            icon: draft.icon,
            chains: draft.chains,
            fee_payment_ref: None,
            status: ConfigurationStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn token_params(&self) -> TokenParams {
        TokenParams {
            name: self.name.clone(),
            symbol: self.symbol.clone(),
            decimals: self.decimals,
            total_supply: self.total_supply.clone(),
            holder: self.creator.clone(),
        }
    }

    pub fn has_fee_payment(&self) -> bool {
        self.fee_payment_ref.is_some()
    }
}

/// Direction of one peer registration transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    HubToPeer,
    PeerToHub,
}

impl LinkDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkDirection::HubToPeer => "hub_to_peer",
            LinkDirection::PeerToHub => "peer_to_hub",
        }
    }
}

/// Deployment progress of one configuration on one chain.
///
/// Every mutation goes through a transition method that validates the state
/// machine and returns the updated copy; the caller persists it with a
/// compare-and-swap on the previous status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub configuration_id: Uuid,
    pub chain_id: String,
    pub chain_name: String,
    pub status: DeploymentStatus,
    pub contract_address: Option<String>,
    pub deployment_tx_id: Option<String>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error_category: Option<ChainErrorCategory>,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub requires_link: bool,
    pub link_status: Option<LinkStatus>,
    pub link_tx_hub_to_peer: Option<String>,
    pub link_tx_peer_to_hub: Option<String>,
    pub link_attempt_count: u32,
    pub link_error_category: Option<ChainErrorCategory>,
    pub link_error: Option<String>,
    /// Transaction handing contract ownership to the creator
    pub ownership_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn new(
        configuration_id: Uuid,
        chain_id: impl Into<String>,
        chain_name: impl Into<String>,
        requires_link: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            configuration_id,
            chain_id: chain_id.into(),
            chain_name: chain_name.into(),
            status: DeploymentStatus::Pending,
            contract_address: None,
            deployment_tx_id: None,
            attempt_count: 0,
            last_attempt_at: None,
            last_error_category: None,
            last_error: None,
            completed_at: None,
            requires_link,
            link_status: requires_link.then_some(LinkStatus::Pending),
            link_tx_hub_to_peer: None,
            link_tx_peer_to_hub: None,
            link_attempt_count: 0,
            link_error_category: None,
            link_error: None,
            ownership_tx_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&self, next: DeploymentStatus, now: DateTime<Utc>) -> DeployerResult<Self> {
        self.status.ensure_transition(next)?;
        let mut updated = self.clone();
        updated.status = next;
        if let Some(link_status) = LinkStatus::from_record_status(next) {
            updated.link_status = Some(link_status);
        }
        updated.updated_at = now;
        Ok(updated)
    }

    fn ensure_status(&self, expected: DeploymentStatus) -> DeployerResult<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(DeployerError::InvalidState(format!(
                "{} on {} is {}, expected {}",
                self.configuration_id, self.chain_id, self.status, expected
            )))
        }
    }

    fn ensure_address_unset(&self) -> DeployerResult<()> {
        match &self.contract_address {
            Some(existing) => Err(DeployerError::ContractAddressConflict {
                chain: self.chain_id.clone(),
                existing: existing.clone(),
            }),
            None => Ok(()),
        }
    }

    /// `pending -> deploying`, counting the attempt before any chain call.
    /// The previous attempt's transaction no longer describes this record.
    pub fn begin_attempt(&self, now: DateTime<Utc>) -> DeployerResult<Self> {
        let mut updated = self.transition(DeploymentStatus::Deploying, now)?;
        updated.attempt_count += 1;
        updated.last_attempt_at = Some(now);
        updated.deployment_tx_id = None;
        Ok(updated)
    }

    /// Remember the submitted deployment transaction while still deploying
    pub fn with_submission(&self, tx_id: &str, now: DateTime<Utc>) -> DeployerResult<Self> {
        self.ensure_status(DeploymentStatus::Deploying)?;
        let mut updated = self.clone();
        updated.deployment_tx_id = Some(tx_id.to_string());
        updated.updated_at = now;
        Ok(updated)
    }

    /// `deploying -> success`
    pub fn complete(
        &self,
        contract_address: &str,
        tx_id: &str,
        now: DateTime<Utc>,
    ) -> DeployerResult<Self> {
        self.ensure_status(DeploymentStatus::Deploying)?;
        self.ensure_address_unset()?;
        let mut updated = self.transition(DeploymentStatus::Success, now)?;
        updated.record_success(contract_address, tx_id, now);
        Ok(updated)
    }

    /// `failed -> success` for a deployment found mined after a local timeout
    pub fn reconcile_success(
        &self,
        contract_address: &str,
        tx_id: &str,
        now: DateTime<Utc>,
    ) -> DeployerResult<Self> {
        self.ensure_status(DeploymentStatus::Failed)?;
        self.ensure_address_unset()?;
        let mut updated = self.transition(DeploymentStatus::Success, now)?;
        updated.record_success(contract_address, tx_id, now);
        Ok(updated)
    }

    fn record_success(&mut self, contract_address: &str, tx_id: &str, now: DateTime<Utc>) {
        self.contract_address = Some(contract_address.to_string());
        self.deployment_tx_id = Some(tx_id.to_string());
        self.completed_at = Some(now);
        self.last_error_category = None;
        self.last_error = None;
    }

    /// `deploying -> failed`, keeping the error category
    pub fn fail(&self, error: &ChainError, now: DateTime<Utc>) -> DeployerResult<Self> {
        let mut updated = self.transition(DeploymentStatus::Failed, now)?;
        updated.last_error_category = Some(error.category);
        updated.last_error = Some(error.message.clone());
        Ok(updated)
    }

    /// Rewrite the failure of an already failed record (reconciliation)
    pub fn reclassify_failure(
        &self,
        error: &ChainError,
        now: DateTime<Utc>,
    ) -> DeployerResult<Self> {
        self.ensure_status(DeploymentStatus::Failed)?;
        let mut updated = self.clone();
        updated.last_error_category = Some(error.category);
        updated.last_error = Some(error.message.clone());
        updated.updated_at = now;
        Ok(updated)
    }

    /// Explicit retry: `failed -> pending` or `link_failed -> link_pending`
    pub fn reset_for_retry(&self, now: DateTime<Utc>) -> DeployerResult<Self> {
        let target = self.status.retry_target().ok_or_else(|| {
            DeployerError::InvalidState(format!(
                "chain {} is {}; only failed or link_failed records can be retried",
                self.chain_id, self.status
            ))
        })?;
        self.transition(target, now)
    }

    /// `success -> link_pending` once both ends of the pair are deployed
    pub fn promote_to_link(&self, now: DateTime<Utc>) -> DeployerResult<Self> {
        if !self.requires_link {
            return Err(DeployerError::InvalidState(format!(
                "chain {} does not require linking",
                self.chain_id
            )));
        }
        self.transition(DeploymentStatus::LinkPending, now)
    }

    /// `link_pending -> link_deploying`
    pub fn begin_link(&self, now: DateTime<Utc>) -> DeployerResult<Self> {
        let mut updated = self.transition(DeploymentStatus::LinkDeploying, now)?;
        updated.link_attempt_count += 1;
        Ok(updated)
    }

    pub fn link_tx(&self, direction: LinkDirection) -> Option<&str> {
        match direction {
            LinkDirection::HubToPeer => self.link_tx_hub_to_peer.as_deref(),
            LinkDirection::PeerToHub => self.link_tx_peer_to_hub.as_deref(),
        }
    }

    /// Record one confirmed registration while the link is in flight
    pub fn with_link_tx(
        &self,
        direction: LinkDirection,
        tx_id: &str,
        now: DateTime<Utc>,
    ) -> DeployerResult<Self> {
        self.ensure_status(DeploymentStatus::LinkDeploying)?;
        let mut updated = self.clone();
        match direction {
            LinkDirection::HubToPeer => updated.link_tx_hub_to_peer = Some(tx_id.to_string()),
            LinkDirection::PeerToHub => updated.link_tx_peer_to_hub = Some(tx_id.to_string()),
        }
        updated.updated_at = now;
        Ok(updated)
    }

    /// `link_deploying -> link_success`; both directions must be recorded
    pub fn complete_link(&self, now: DateTime<Utc>) -> DeployerResult<Self> {
        if self.link_tx_hub_to_peer.is_none() || self.link_tx_peer_to_hub.is_none() {
            return Err(DeployerError::InvalidState(format!(
                "link for chain {} is missing a registration transaction",
                self.chain_id
            )));
        }
        let mut updated = self.transition(DeploymentStatus::LinkSuccess, now)?;
        updated.link_error_category = None;
        updated.link_error = None;
        Ok(updated)
    }

    /// `link_deploying -> link_failed`
    pub fn fail_link(&self, error: &ChainError, now: DateTime<Utc>) -> DeployerResult<Self> {
        let mut updated = self.transition(DeploymentStatus::LinkFailed, now)?;
        updated.link_error_category = Some(error.category);
        updated.link_error = Some(error.message.clone());
        Ok(updated)
    }

    /// Mark an execution interrupted by a restart as timed out
    pub fn mark_interrupted(&self, now: DateTime<Utc>) -> DeployerResult<Self> {
        let error = ChainError::new(
            self.chain_id.clone(),
            ChainErrorCategory::Timeout,
            "execution interrupted before the chain call returned",
        );
        match self.status {
            DeploymentStatus::Deploying => self.fail(&error, now),
            DeploymentStatus::LinkDeploying => self.fail_link(&error, now),
            other => Err(DeployerError::InvalidState(format!(
                "chain {} is {}, nothing in flight",
                self.chain_id, other
            ))),
        }
    }

    /// Deployed, linked if needed, and still owned by the deployer wallet
    pub fn awaits_ownership_transfer(&self) -> bool {
        self.status.is_success() && self.contract_address.is_some() && self.ownership_tx_id.is_none()
    }

    /// Record the ownership hand-over; the status is unchanged
    pub fn with_ownership_transfer(&self, tx_id: &str, now: DateTime<Utc>) -> DeployerResult<Self> {
        if !self.awaits_ownership_transfer() {
            return Err(DeployerError::InvalidState(format!(
                "chain {} of {} is {} and cannot hand over ownership",
                self.chain_id, self.configuration_id, self.status
            )));
        }
        let mut updated = self.clone();
        updated.ownership_tx_id = Some(tx_id.to_string());
        updated.updated_at = now;
        Ok(updated)
    }

    /// A timed-out deployment whose transaction may still have been mined
    pub fn is_reconcilable(&self) -> bool {
        self.status == DeploymentStatus::Failed
            && self.last_error_category == Some(ChainErrorCategory::Timeout)
            && self.deployment_tx_id.is_some()
            && self.contract_address.is_none()
    }
}

/// Human readable summary of failing chains, `None` when nothing failed
pub fn summarize_failures(records: &[DeploymentRecord]) -> Option<String> {
    let failures: Vec<String> = records
        .iter()
        .filter_map(|record| {
            let (category, message) = match record.status {
                DeploymentStatus::Failed => (record.last_error_category, &record.last_error),
                DeploymentStatus::LinkFailed => (record.link_error_category, &record.link_error),
                _ => return None,
            };
            let category = category.unwrap_or(ChainErrorCategory::Unknown);
            Some(match message {
                Some(message) => format!("{}: {} ({})", record.chain_id, category, message),
                None => format!("{}: {}", record.chain_id, category),
            })
        })
        .collect();

    if failures.is_empty() {
        None
    } else {
        Some(failures.join("; "))
    }
}

/// Aggregate status plus every child record, as returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatusReport {
    pub configuration: TokenConfiguration,
    pub records: Vec<DeploymentRecord>,
}

impl DeploymentStatusReport {
    pub fn record(&self, chain_id: &str) -> Option<&DeploymentRecord> {
        self.records.iter().find(|r| r.chain_id == chain_id)
    }
}
