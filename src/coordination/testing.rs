//! Scripted chain client and fixtures for orchestrator tests

use super::Orchestrator;
use crate::chain::tests::test_registry;
use crate::chain::{ChainDeploymentClient, DeployReceipt};
use crate::config::OrchestratorConfig;
use crate::error::{ChainError, ChainErrorCategory};
use crate::model::{ConfigurationStatus, DeploymentStatus, NewTokenConfiguration, TokenParams};
use crate::state::MemoryStore;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const FEE_REF: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

pub fn tx_hash(n: u64) -> String {
    format!("0x{:064x}", n)
}

pub fn receipt(n: u64, tx_id: &str) -> DeployReceipt {
    DeployReceipt {
        contract_address: format!("0x{:040x}", n),
        tx_id: tx_id.to_string(),
    }
}

pub fn draft(chains: &[&str]) -> NewTokenConfiguration {
    NewTokenConfiguration {
        creator: "0x1111111111111111111111111111111111111111".to_string(),
        name: "Rainbow Token".to_string(),
        symbol: "RBW".to_string(),
        decimals: 18,
        total_supply: "1000000000000000000000000".to_string(),
        icon: Some("ipfs://rainbow".to_string()),
        chains: chains.iter().map(|c| c.to_string()).collect(),
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        hub_chain: "ethereum".to_string(),
        max_concurrent_txs: 8,
        submit_timeout_ms: 1_000,
        confirmation_timeout_ms: 1_000,
        link_timeout_ms: 1_000,
        max_auto_attempts: 3,
        retry_delay_ms: 1,
        max_retry_delay_ms: 5,
        ..OrchestratorConfig::default()
    }
}

pub fn orchestrator<C>(client: C) -> (Orchestrator, Arc<MemoryStore>)
where
    C: ChainDeploymentClient + 'static,
{
    orchestrator_with(client, |_| {})
}

pub fn orchestrator_with<C, F>(client: C, tweak: F) -> (Orchestrator, Arc<MemoryStore>)
where
    C: ChainDeploymentClient + 'static,
    F: FnOnce(&mut OrchestratorConfig),
{
    let mut config = test_config();
    tweak(&mut config);
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(client),
        Arc::new(test_registry()),
        config,
    );
    (orchestrator, store)
}

/// Create a configuration and attach the fee payment
pub async fn paid_configuration(orchestrator: &Orchestrator, chains: &[&str]) -> Uuid {
    let id = orchestrator
        .create_configuration(draft(chains))
        .await
        .unwrap()
        .id;
    orchestrator.attach_fee_payment(id, FEE_REF).await.unwrap();
    id
}

pub async fn wait_for_status(orchestrator: &Orchestrator, id: Uuid, expected: ConfigurationStatus) {
    for _ in 0..500 {
        let report = orchestrator.get_status(id).await.unwrap();
        if report.configuration.status == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("configuration {} never reached {}", id, expected);
}

pub async fn wait_for_record(
    orchestrator: &Orchestrator,
    id: Uuid,
    chain: &str,
    expected: DeploymentStatus,
) {
    for _ in 0..500 {
        let report = orchestrator.get_status(id).await.unwrap();
        if report.record(chain).map(|r| r.status) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("chain {} of {} never reached {}", chain, id, expected);
}

/// Scripted behaviour of one deployment attempt
#[derive(Debug, Clone, Copy)]
enum DeployScript {
    FailSubmit(ChainErrorCategory),
    HangSubmit,
    FailAwait(ChainErrorCategory),
    HangAwait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    NotFound,
    Mined,
    Reverted,
}

#[derive(Default)]
struct Script {
    deploys: HashMap<String, VecDeque<DeployScript>>,
    /// Script picked at submission, applied when awaiting that transaction
    awaiting: HashMap<String, DeployScript>,
    links: HashMap<String, VecDeque<ChainErrorCategory>>,
    submissions: HashMap<String, usize>,
    registrations: Vec<(String, String)>,
    transfer_failures: HashMap<String, VecDeque<ChainErrorCategory>>,
    transfers: Vec<(String, String)>,
}

/// Chain client that succeeds unless told otherwise, one script entry per call
#[derive(Clone)]
pub struct ScriptedClient {
    script: Arc<Mutex<Script>>,
    lookup: Arc<Mutex<Lookup>>,
    counter: Arc<AtomicU64>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            lookup: Arc::new(Mutex::new(Lookup::NotFound)),
            counter: Arc::new(AtomicU64::new(1)),
        }
    }

    fn push_deploy(&self, chain: &str, step: DeployScript) {
        self.script
            .lock()
            .unwrap()
            .deploys
            .entry(chain.to_string())
            .or_default()
            .push_back(step);
    }

    /// Next deployment on `chain` is mined but fails with `category`
    pub fn fail_deploy(&self, chain: &str, category: ChainErrorCategory) {
        self.fail_await(chain, category);
    }

    pub fn fail_submit(&self, chain: &str, category: ChainErrorCategory) {
        self.push_deploy(chain, DeployScript::FailSubmit(category));
    }

    pub fn hang_submit(&self, chain: &str) {
        self.push_deploy(chain, DeployScript::HangSubmit);
    }

    pub fn fail_await(&self, chain: &str, category: ChainErrorCategory) {
        self.push_deploy(chain, DeployScript::FailAwait(category));
    }

    pub fn hang_await(&self, chain: &str) {
        self.push_deploy(chain, DeployScript::HangAwait);
    }

    /// Next registration sent on `chain` fails with `category`
    pub fn fail_link(&self, chain: &str, category: ChainErrorCategory) {
        self.script
            .lock()
            .unwrap()
            .links
            .entry(chain.to_string())
            .or_default()
            .push_back(category);
    }

    /// Next ownership transfer on `chain` fails with `category`
    pub fn fail_transfer(&self, chain: &str, category: ChainErrorCategory) {
        self.script
            .lock()
            .unwrap()
            .transfer_failures
            .entry(chain.to_string())
            .or_default()
            .push_back(category);
    }

    /// Receipt lookups find every transaction mined
    pub fn mine_on_lookup(&self) {
        *self.lookup.lock().unwrap() = Lookup::Mined;
    }

    pub fn revert_on_lookup(&self) {
        *self.lookup.lock().unwrap() = Lookup::Reverted;
    }

    /// Deployment transactions submitted on `chain`
    pub fn submissions(&self, chain: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .submissions
            .get(chain)
            .copied()
            .unwrap_or(0)
    }

    /// `(chain sent on, remote chain)` for every registration attempt
    pub fn registrations(&self) -> Vec<(String, String)> {
        self.script.lock().unwrap().registrations.clone()
    }

    /// `(chain, new owner)` for every successful ownership transfer
    pub fn transfers(&self) -> Vec<(String, String)> {
        self.script.lock().unwrap().transfers.clone()
    }

    pub fn registrations_on(&self, chain: &str, remote_chain: &str) -> usize {
        self.registrations()
            .iter()
            .filter(|(c, r)| c == chain && r == remote_chain)
            .count()
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainDeploymentClient for ScriptedClient {
    async fn submit_deployment(
        &self,
        chain: &str,
        _params: &TokenParams,
    ) -> Result<String, ChainError> {
        let step = {
            let mut script = self.script.lock().unwrap();
            *script.submissions.entry(chain.to_string()).or_default() += 1;
            script.deploys.get_mut(chain).and_then(|q| q.pop_front())
        };

        match step {
            Some(DeployScript::FailSubmit(category)) => {
                Err(ChainError::new(chain, category, "scripted submission failure"))
            }
            Some(DeployScript::HangSubmit) => std::future::pending().await,
            other => {
                let tx_id = tx_hash(self.next());
                if let Some(step) = other {
                    self.script
                        .lock()
                        .unwrap()
                        .awaiting
                        .insert(tx_id.clone(), step);
                }
                Ok(tx_id)
            }
        }
    }

    async fn await_deployment(&self, chain: &str, tx_id: &str) -> Result<DeployReceipt, ChainError> {
        let step = self.script.lock().unwrap().awaiting.remove(tx_id);
        match step {
            Some(DeployScript::FailAwait(category)) => {
                Err(ChainError::new(chain, category, "scripted deployment failure"))
            }
            Some(DeployScript::HangAwait) => std::future::pending().await,
            _ => Ok(receipt(self.next(), tx_id)),
        }
    }

    async fn deployment_receipt(
        &self,
        chain: &str,
        tx_id: &str,
    ) -> Result<Option<DeployReceipt>, ChainError> {
        let lookup = *self.lookup.lock().unwrap();
        match lookup {
            Lookup::NotFound => Ok(None),
            Lookup::Mined => Ok(Some(receipt(self.next(), tx_id))),
            Lookup::Reverted => Err(ChainError::new(
                chain,
                ChainErrorCategory::Reverted,
                "deployment transaction reverted",
            )),
        }
    }

    async fn register_peer(
        &self,
        chain: &str,
        _local_address: &str,
        remote_chain: &str,
        _remote_address: &str,
    ) -> Result<String, ChainError> {
        let failure = {
            let mut script = self.script.lock().unwrap();
            script
                .registrations
                .push((chain.to_string(), remote_chain.to_string()));
            script.links.get_mut(chain).and_then(|q| q.pop_front())
        };

        match failure {
            Some(category) => Err(ChainError::new(chain, category, "scripted registration failure")),
            None => Ok(tx_hash(self.next())),
        }
    }

    async fn transfer_ownership(
        &self,
        chain: &str,
        _contract_address: &str,
        new_owner: &str,
    ) -> Result<String, ChainError> {
        let mut script = self.script.lock().unwrap();
        if let Some(category) = script
            .transfer_failures
            .get_mut(chain)
            .and_then(|q| q.pop_front())
        {
            return Err(ChainError::new(chain, category, "scripted transfer failure"));
        }
        script
            .transfers
            .push((chain.to_string(), new_owner.to_string()));
        drop(script);
        Ok(tx_hash(self.next()))
    }
}
