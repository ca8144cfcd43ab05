//! Deployment state machine and aggregate status rule

use crate::error::{DeployerError, DeployerResult};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a single (configuration, chain) deployment record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Success,
    Failed,
    LinkPending,
    LinkDeploying,
    LinkSuccess,
    LinkFailed,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 8] = [
        DeploymentStatus::Pending,
        DeploymentStatus::Deploying,
        DeploymentStatus::Success,
        DeploymentStatus::Failed,
        DeploymentStatus::LinkPending,
        DeploymentStatus::LinkDeploying,
        DeploymentStatus::LinkSuccess,
        DeploymentStatus::LinkFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::LinkPending => "link_pending",
            DeploymentStatus::LinkDeploying => "link_deploying",
            DeploymentStatus::LinkSuccess => "link_success",
            DeploymentStatus::LinkFailed => "link_failed",
        }
    }

    /// Work is still outstanding for this record
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Pending
                | DeploymentStatus::Deploying
                | DeploymentStatus::LinkPending
                | DeploymentStatus::LinkDeploying
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeploymentStatus::Success | DeploymentStatus::LinkSuccess)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::LinkFailed)
    }

    /// Status an explicit retry resets to
    pub fn retry_target(&self) -> Option<DeploymentStatus> {
        match self {
            DeploymentStatus::Failed => Some(DeploymentStatus::Pending),
            DeploymentStatus::LinkFailed => Some(DeploymentStatus::LinkPending),
            _ => None,
        }
    }

    /// Adjacency list of the record state machine.
    ///
    /// `Failed -> Success` is only taken by reconciliation, when a transaction
    /// that timed out locally is later found mined.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        matches!(
            (self, next),
            (Pending, Deploying)
                | (Deploying, Success)
                | (Deploying, Failed)
                | (Failed, Pending)
                | (Failed, Success)
                | (Success, LinkPending)
                | (LinkPending, LinkDeploying)
                | (LinkDeploying, LinkSuccess)
                | (LinkDeploying, LinkFailed)
                | (LinkFailed, LinkPending)
        )
    }

    pub fn ensure_transition(&self, next: DeploymentStatus) -> DeployerResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DeployerError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = DeployerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeploymentStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| DeployerError::Internal(format!("unknown deployment status: {}", s)))
    }
}

/// Link sub-state of a record that must be linked to the hub chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkStatus {
    #[serde(rename = "link_pending")]
    Pending,
    #[serde(rename = "link_deploying")]
    Deploying,
    #[serde(rename = "link_success")]
    Success,
    #[serde(rename = "link_failed")]
    Failed,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Pending => "link_pending",
            LinkStatus::Deploying => "link_deploying",
            LinkStatus::Success => "link_success",
            LinkStatus::Failed => "link_failed",
        }
    }

    /// Link status mirrored by a record status in the link phase
    pub fn from_record_status(status: DeploymentStatus) -> Option<LinkStatus> {
        match status {
            DeploymentStatus::LinkPending => Some(LinkStatus::Pending),
            DeploymentStatus::LinkDeploying => Some(LinkStatus::Deploying),
            DeploymentStatus::LinkSuccess => Some(LinkStatus::Success),
            DeploymentStatus::LinkFailed => Some(LinkStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkStatus {
    type Err = DeployerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "link_pending" => Ok(LinkStatus::Pending),
            "link_deploying" => Ok(LinkStatus::Deploying),
            "link_success" => Ok(LinkStatus::Success),
            "link_failed" => Ok(LinkStatus::Failed),
            other => Err(DeployerError::Internal(format!("unknown link status: {}", other))),
        }
    }
}

/// Aggregate status of a token configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigurationStatus {
    Pending,
    Deploying,
    Completed,
    Partial,
    Failed,
}

impl ConfigurationStatus {
    pub const ALL: [ConfigurationStatus; 5] = [
        ConfigurationStatus::Pending,
        ConfigurationStatus::Deploying,
        ConfigurationStatus::Completed,
        ConfigurationStatus::Partial,
        ConfigurationStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationStatus::Pending => "pending",
            ConfigurationStatus::Deploying => "deploying",
            ConfigurationStatus::Completed => "completed",
            ConfigurationStatus::Partial => "partial",
            ConfigurationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConfigurationStatus::Completed
                | ConfigurationStatus::Partial
                | ConfigurationStatus::Failed
        )
    }

    /// Derive the aggregate status from child record statuses.
    ///
    /// Most severe wins: anything in flight keeps the configuration
    /// `deploying`; otherwise all-success is `completed`, a mix is `partial`
    /// and the rest is `failed`.
    pub fn aggregate<I>(statuses: I) -> ConfigurationStatus
    where
        I: IntoIterator<Item = DeploymentStatus>,
    {
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for status in statuses {
            if status.is_in_flight() {
                return ConfigurationStatus::Deploying;
            }
            if status.is_success() {
                succeeded += 1;
            } else if status.is_failure() {
                failed += 1;
            }
        }

        match (succeeded, failed) {
            (s, 0) if s > 0 => ConfigurationStatus::Completed,
            (s, f) if s > 0 && f > 0 => ConfigurationStatus::Partial,
            _ => ConfigurationStatus::Failed,
        }
    }
}

impl fmt::Display for ConfigurationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigurationStatus {
    type Err = DeployerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigurationStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| {
                DeployerError::Internal(format!("unknown configuration status: {}", s))
            })
    }
}
