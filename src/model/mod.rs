//! Deployment domain model
//!
//! Token configurations, their per-chain deployment records and the record
//! state machine that every orchestrator write is validated against.

pub mod record;
pub mod status;

pub use record::{
    is_tx_hash, summarize_failures, DeploymentRecord, DeploymentStatusReport, LinkDirection,
    NewTokenConfiguration, TokenConfiguration, TokenParams,
};
pub use status::{ConfigurationStatus, DeploymentStatus, LinkStatus};
