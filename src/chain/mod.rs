//! Chain module - deployment and peer registration on every configured chain
//!
//! This module provides:
//! - The `ChainDeploymentClient` seam the orchestrator drives
//! - A registry of enabled chains and the hub designation
//! - Multi-RPC provider management with automatic failover
//! - An EVM client that deploys token contracts and registers peers

pub mod evm;
pub mod provider;

pub use evm::EvmDeploymentClient;
pub use provider::ChainProvider;

use crate::config::Settings;
use crate::error::{ChainError, DeployerError, DeployerResult};
use crate::model::TokenParams;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Outcome of a mined token deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployReceipt {
    pub contract_address: String,
    pub tx_id: String,
}

/// Operations the orchestrator consumes from a chain.
///
/// A deployment is split into submission and confirmation so the transaction
/// id can be persisted before waiting on the chain; a full `deployToken` is
/// `submit_deployment` followed by `await_deployment`. Linking a pair is two
/// independent `register_peer` calls, one per direction. The client's own
/// wallet owns every contract it deploys until `transfer_ownership`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainDeploymentClient: Send + Sync {
    /// Submit a token deployment and return its transaction id
    async fn submit_deployment(
        &self,
        chain: &str,
        params: &TokenParams,
    ) -> Result<String, ChainError>;

    /// Wait until a submitted deployment is confirmed
    async fn await_deployment(&self, chain: &str, tx_id: &str)
        -> Result<DeployReceipt, ChainError>;

    /// Look up a deployment without waiting; `None` while it is not confirmed
    async fn deployment_receipt(
        &self,
        chain: &str,
        tx_id: &str,
    ) -> Result<Option<DeployReceipt>, ChainError>;

    /// Register `remote_address` on `remote_chain` as the peer of the contract
    /// at `local_address` on `chain`; returns the confirmed transaction id
    async fn register_peer(
        &self,
        chain: &str,
        local_address: &str,
        remote_chain: &str,
        remote_address: &str,
    ) -> Result<String, ChainError>;

    /// Hand ownership of the contract at `contract_address` to `new_owner`;
    /// returns the confirmed transaction id
    async fn transfer_ownership(
        &self,
        chain: &str,
        contract_address: &str,
        new_owner: &str,
    ) -> Result<String, ChainError>;
}

/// Static description of an enabled chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainInfo {
    pub key: String,
    pub name: String,
    pub chain_id: u64,
    pub endpoint_id: u32,
}

/// Enabled chains and the hub designation
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    chains: HashMap<String, ChainInfo>,
    hub: String,
}

impl ChainRegistry {
    pub fn new(chains: Vec<ChainInfo>, hub: impl Into<String>) -> Self {
        Self {
            chains: chains.into_iter().map(|c| (c.key.clone(), c)).collect(),
            hub: hub.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let chains = settings
            .enabled_chains()
            .into_iter()
            .map(|(key, chain)| ChainInfo {
                key: key.clone(),
                name: chain.name.clone(),
                chain_id: chain.chain_id,
                endpoint_id: chain.endpoint_id,
            })
            .collect();

        Self::new(chains, settings.orchestrator.hub_chain.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.chains.contains_key(key)
    }

    pub fn get(&self, key: &str) -> DeployerResult<&ChainInfo> {
        self.chains
            .get(key)
            .ok_or_else(|| DeployerError::UnknownChain(key.to_string()))
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    pub fn is_hub(&self, key: &str) -> bool {
        self.hub == key
    }

    /// Hub chain if it is part of the selection
    pub fn hub_in<'a>(&self, selected: &'a [String]) -> Option<&'a str> {
        selected
            .iter()
            .find(|c| self.is_hub(c))
            .map(|c| c.as_str())
    }

    /// Peers are linked only when the hub itself is selected
    pub fn requires_link(&self, selected: &[String], chain: &str) -> bool {
        !self.is_hub(chain) && self.hub_in(selected).is_some()
    }

    /// All chains ordered by key
    pub fn chains(&self) -> Vec<&ChainInfo> {
        let mut chains: Vec<_> = self.chains.values().collect();
        chains.sort_by(|a, b| a.key.cmp(&b.key));
        chains
    }
}

/// Manages RPC connections to all configured chains
pub struct ChainManager {
    /// Chain providers indexed by chain key
    providers: DashMap<String, Arc<ChainProvider>>,
}

impl ChainManager {
    /// Create a chain manager with a provider for every enabled chain
    pub async fn new(settings: &Settings) -> DeployerResult<Self> {
        let providers = DashMap::new();

        for (key, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                chain_config.name, chain_config.chain_id
            );

            let provider = ChainProvider::new(key.clone(), chain_config.clone()).await?;
            providers.insert(key.clone(), Arc::new(provider));
        }

        Ok(Self { providers })
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain: &str) -> Option<Arc<ChainProvider>> {
        self.providers.get(chain).map(|p| p.clone())
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let providers: Vec<_> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut results = Vec::with_capacity(providers.len());
        for (chain, provider) in providers {
            let healthy = provider.health_check().await;
            crate::metrics::record_chain_health(&chain, healthy);
            results.push((chain, healthy));
        }

        results.sort();
        results
    }

    /// Get all connected chain keys
    pub fn connected_chains(&self) -> Vec<String> {
        let mut chains: Vec<_> = self.providers.iter().map(|e| e.key().clone()).collect();
        chains.sort();
        chains
    }
}
