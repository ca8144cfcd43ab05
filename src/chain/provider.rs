//! Chain provider with multi-RPC support and automatic failover

use crate::config::ChainConfig;
use crate::error::{DeployerError, DeployerResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain key from configuration
    key: String,
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(key: String, config: ChainConfig) -> DeployerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider =
                        provider.interval(Duration::from_millis(config.poll_interval_ms));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", key, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(DeployerError::Config(format!(
                "No valid RPC providers for chain {}",
                key
            )));
        }

        match http_providers[0].get_block_number().await {
            Ok(block) => debug!("Chain {} at block {}", key, block),
            Err(e) => warn!("Chain {} unreachable at startup: {}", key, e),
        }

        Ok(Self {
            key,
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.key, next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> Result<u64, ProviderError> {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.key, e);
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::CustomError("All providers failed".to_string())))
    }

    /// Get transaction receipt with failover
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TransactionReceipt>, ProviderError> {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    warn!(
                        "Failed to get receipt {:?} from chain {}: {}",
                        tx_hash, self.key, e
                    );
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::CustomError("All providers failed".to_string())))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.key, e);
                false
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Numeric EVM chain id used for signing
    pub fn evm_chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config.confirmation_blocks
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }
}
