//! Deployment orchestration across chains
//!
//! The orchestrator:
//! 1. Creates configurations with one pending record per selected chain
//! 2. Deploys every chain concurrently, retrying transient failures
//! 3. Links each deployed peer with the hub chain
//! 4. Keeps the aggregate status in step with the records
//! 5. Hands contracts of completed configurations to their creator
//! 6. Reconciles timed-out deployments and recovers interrupted work

mod engine;
mod executor;
mod linking;
mod ownership;
mod reconcile;
#[cfg(test)]
pub(crate) mod testing;

pub use engine::{DeploymentHandle, Orchestrator};
