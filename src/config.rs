//! Configuration management for the token deployer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub wallet: WalletConfig,
    pub contracts: ContractsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Chain key hosting the cross-chain messaging contract
    pub hub_chain: String,
    pub max_concurrent_txs: usize,
    pub submit_timeout_ms: u64,
    pub confirmation_timeout_ms: u64,
    pub link_timeout_ms: u64,
    /// Total attempts (manual retries excluded) for timeout/network failures
    pub max_auto_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub reconcile_interval_secs: u64,
    pub health_check_interval_secs: u64,
}

impl OrchestratorConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }

    /// Delay before automatic attempt `attempt + 1`, doubling per attempt
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.retry_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }

    /// Longest a healthy execution can stay in flight
    pub fn max_execution_time(&self) -> Duration {
        self.submit_timeout() + self.confirmation_timeout() + self.link_timeout()
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            hub_chain: String::new(),
            max_concurrent_txs: 16,
            submit_timeout_ms: 60_000,
            confirmation_timeout_ms: 600_000,
            link_timeout_ms: 600_000,
            max_auto_attempts: 3,
            retry_delay_ms: 5_000,
            max_retry_delay_ms: 300_000,
            reconcile_interval_secs: 60,
            health_check_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL, or `memory://` for a non-durable in-process store
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Endpoint id peers use to address this chain when registering
    pub endpoint_id: u32,
    pub confirmation_blocks: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub enabled: bool,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding the deployer private key
    pub private_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractsConfig {
    /// Compiled token artifact (JSON with `abi` and `bytecode`)
    pub token_artifact: PathBuf,
}

impl Settings {
    /// Load settings from the file named by `DEPLOYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("DEPLOYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        match self.chains.get(&self.orchestrator.hub_chain) {
            Some(hub) if hub.enabled => {}
            Some(_) => anyhow::bail!("Hub chain {} is disabled", self.orchestrator.hub_chain),
            None => anyhow::bail!(
                "Hub chain {} is not configured",
                self.orchestrator.hub_chain
            ),
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        let o = &self.orchestrator;
        if o.submit_timeout_ms == 0 || o.confirmation_timeout_ms == 0 || o.link_timeout_ms == 0 {
            anyhow::bail!("Chain call timeouts must be non-zero");
        }
        if o.max_auto_attempts == 0 {
            anyhow::bail!("max_auto_attempts must be at least 1");
        }
        if o.max_concurrent_txs == 0 {
            anyhow::bail!("max_concurrent_txs must be at least 1");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
