//! Error types for the token deployer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Category of a failed chain operation.
///
/// The category is persisted alongside the error message on the deployment
/// record; it decides whether the executor may retry on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainErrorCategory {
    Timeout,
    Reverted,
    InsufficientFunds,
    Network,
    Unknown,
}

impl ChainErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainErrorCategory::Timeout => "timeout",
            ChainErrorCategory::Reverted => "reverted",
            ChainErrorCategory::InsufficientFunds => "insufficient_funds",
            ChainErrorCategory::Network => "network",
            ChainErrorCategory::Unknown => "unknown",
        }
    }

    /// Timeouts and network failures may be retried without user action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChainErrorCategory::Timeout | ChainErrorCategory::Network
        )
    }
}

impl fmt::Display for ChainErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainErrorCategory {
    type Err = DeployerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(ChainErrorCategory::Timeout),
            "reverted" => Ok(ChainErrorCategory::Reverted),
            "insufficient_funds" => Ok(ChainErrorCategory::InsufficientFunds),
            "network" => Ok(ChainErrorCategory::Network),
            "unknown" => Ok(ChainErrorCategory::Unknown),
            other => Err(DeployerError::Internal(format!(
                "unknown error category: {}",
                other
            ))),
        }
    }
}

/// Failure of an external deploy or link call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{category} on chain {chain}: {message}")]
pub struct ChainError {
    pub chain: String,
    pub category: ChainErrorCategory,
    pub message: String,
}

impl ChainError {
    pub fn new(
        chain: impl Into<String>,
        category: ChainErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            chain: chain.into(),
            category,
            message: message.into(),
        }
    }

    pub fn timeout(chain: impl Into<String>, operation: &str, secs: u64) -> Self {
        Self::new(
            chain,
            ChainErrorCategory::Timeout,
            format!("timed out after {}s waiting for {}", secs, operation),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

/// Main error type for the deployer
#[derive(Error, Debug)]
pub enum DeployerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Contract address already recorded for {chain}: {existing}")]
    ContractAddressConflict { chain: String, existing: String },

    #[error("Chain {0} is not configured")]
    UnknownChain(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployerError {
    pub fn configuration_not_found(id: impl fmt::Display) -> Self {
        DeployerError::NotFound {
            entity: "Configuration",
            id: id.to_string(),
        }
    }

    pub fn record_not_found(id: impl fmt::Display, chain: &str) -> Self {
        DeployerError::NotFound {
            entity: "Deployment record",
            id: format!("{}/{}", id, chain),
        }
    }

    /// Errors the caller of an orchestrator operation must handle
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DeployerError::Validation(_)
                | DeployerError::InvalidState(_)
                | DeployerError::InvalidStateTransition { .. }
                | DeployerError::NotFound { .. }
                | DeployerError::UnknownChain(_)
        )
    }
}

/// Result type for deployer operations
pub type DeployerResult<T> = Result<T, DeployerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trip_through_storage_form() {
        for category in [
            ChainErrorCategory::Timeout,
            ChainErrorCategory::Reverted,
            ChainErrorCategory::InsufficientFunds,
            ChainErrorCategory::Network,
            ChainErrorCategory::Unknown,
        ] {
            assert_eq!(category.as_str().parse::<ChainErrorCategory>().unwrap(), category);
        }
        assert!("boom".parse::<ChainErrorCategory>().is_err());
    }

    #[test]
    fn test_only_transient_categories_are_retryable() {
        assert!(ChainErrorCategory::Timeout.is_retryable());
        assert!(ChainErrorCategory::Network.is_retryable());
        assert!(!ChainErrorCategory::Reverted.is_retryable());
        assert!(!ChainErrorCategory::InsufficientFunds.is_retryable());
        assert!(!ChainErrorCategory::Unknown.is_retryable());
    }

    #[test]
    fn test_client_errors() {
        assert!(DeployerError::configuration_not_found("abc").is_client_error());
        assert!(DeployerError::InvalidState("x".into()).is_client_error());
        assert!(!DeployerError::Internal("x".into()).is_client_error());
        let chain = ChainError::timeout("base", "receipt", 30);
        assert!(!DeployerError::from(chain).is_client_error());
    }
}
