//! EVM implementation of the chain deployment client
//!
//! Deploys the token artifact with constructor
//! `(string name, string symbol, uint8 decimals, uint256 supply, address holder, address owner)`,
//! owned by the deployer wallet so it can link contracts through
//! `setPeer(uint32 eid, bytes32 peer)`, then hands ownership over with
//! `transferOwnership(address)`.

use super::{ChainDeploymentClient, ChainManager, ChainProvider, ChainRegistry, DeployReceipt};
use crate::config::{ContractsConfig, WalletConfig};
use crate::error::{ChainError, ChainErrorCategory, DeployerError, DeployerResult};
use crate::locks::KeyedLocks;
use crate::model::TokenParams;

use async_trait::async_trait;
use ethers::abi::{Abi, Tokenize};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::utils::to_checksum;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

abigen!(
    TokenPeer,
    r#"[
        function setPeer(uint32 eid, bytes32 peer) external
        function transferOwnership(address newOwner) external
    ]"#
);

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Compiled token contract
#[derive(Debug, Clone)]
pub struct TokenArtifact {
    pub abi: Abi,
    pub bytecode: Bytes,
}

#[derive(Deserialize)]
struct RawArtifact {
    abi: Abi,
    bytecode: RawBytecode,
}

/// Hardhat stores bytecode as a string, Foundry nests it under `object`
#[derive(Deserialize)]
#[serde(untagged)]
enum RawBytecode {
    Hex(Bytes),
    Object { object: Bytes },
}

impl TokenArtifact {
    pub fn load(path: &Path) -> DeployerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DeployerError::Config(format!("Failed to read token artifact {:?}: {}", path, e))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> DeployerResult<Self> {
        let artifact: RawArtifact = serde_json::from_str(raw)
            .map_err(|e| DeployerError::Config(format!("Invalid token artifact: {}", e)))?;

        let bytecode = match artifact.bytecode {
            RawBytecode::Hex(bytes) => bytes,
            RawBytecode::Object { object } => object,
        };
        if bytecode.is_empty() {
            return Err(DeployerError::Config(
                "Token artifact has empty bytecode".to_string(),
            ));
        }

        Ok(Self {
            abi: artifact.abi,
            bytecode,
        })
    }

    /// Creation code with ABI-encoded constructor arguments
    pub fn creation_code(&self, params: &TokenParams, owner: Address) -> Result<Bytes, String> {
        let holder: Address = params
            .holder
            .parse()
            .map_err(|e| format!("invalid holder address {}: {}", params.holder, e))?;
        let supply = U256::from_dec_str(&params.total_supply)
            .map_err(|e| format!("invalid total supply {}: {}", params.total_supply, e))?;

        let args = (
            params.name.clone(),
            params.symbol.clone(),
            params.decimals,
            supply,
            holder,
            owner,
        )
            .into_tokens();

        match self.abi.constructor() {
            Some(constructor) => constructor
                .encode_input(self.bytecode.to_vec(), &args)
                .map(Bytes::from)
                .map_err(|e| format!("constructor encoding failed: {}", e)),
            None => Err("token artifact has no constructor".to_string()),
        }
    }
}

/// Map a node or middleware error message onto a category
pub fn classify_error(chain: &str, message: &str) -> ChainError {
    let lower = message.to_lowercase();

    let category = if lower.contains("insufficient funds") {
        ChainErrorCategory::InsufficientFunds
    } else if lower.contains("revert") {
        ChainErrorCategory::Reverted
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ChainErrorCategory::Timeout
    } else if [
        "error sending request",
        "connection",
        "dns",
        "502",
        "503",
        "429",
        "rate limit",
        "nonce too low",
        "replacement transaction underpriced",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
    {
        ChainErrorCategory::Network
    } else {
        ChainErrorCategory::Unknown
    };

    ChainError::new(chain, category, message)
}

fn parse_tx_hash(chain: &str, tx_id: &str) -> Result<H256, ChainError> {
    tx_id.parse::<H256>().map_err(|e| {
        ChainError::new(
            chain,
            ChainErrorCategory::Unknown,
            format!("invalid transaction id {}: {}", tx_id, e),
        )
    })
}

fn parse_address(chain: &str, address: &str) -> Result<Address, ChainError> {
    address.parse::<Address>().map_err(|e| {
        ChainError::new(
            chain,
            ChainErrorCategory::Unknown,
            format!("invalid contract address {}: {}", address, e),
        )
    })
}

/// Left-pad an EVM address into the bytes32 peer format
fn address_to_peer(address: Address) -> [u8; 32] {
    let mut peer = [0u8; 32];
    peer[12..].copy_from_slice(address.as_bytes());
    peer
}

fn format_tx_hash(hash: H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

/// Deploys and links token contracts on EVM chains
pub struct EvmDeploymentClient {
    chains: Arc<ChainManager>,
    registry: Arc<ChainRegistry>,
    wallet: LocalWallet,
    artifact: TokenArtifact,
    /// Serializes submissions per chain so nonces are never raced
    submissions: KeyedLocks<String>,
}

impl EvmDeploymentClient {
    pub fn new(
        chains: Arc<ChainManager>,
        registry: Arc<ChainRegistry>,
        wallet_config: &WalletConfig,
        contracts: &ContractsConfig,
    ) -> DeployerResult<Self> {
        let wallet = Self::load_wallet(wallet_config)?;
        let artifact = TokenArtifact::load(&contracts.token_artifact)?;

        info!("Deployment client initialized with wallet: {:?}", wallet.address());

        Ok(Self {
            chains,
            registry,
            wallet,
            artifact,
            submissions: KeyedLocks::new(),
        })
    }

    /// Load wallet from the configured environment variable
    fn load_wallet(config: &WalletConfig) -> DeployerResult<LocalWallet> {
        let var = config
            .private_key_env
            .as_deref()
            .unwrap_or("DEPLOYER_PRIVATE_KEY");

        let key = std::env::var(var).map_err(|_| {
            DeployerError::Config(format!("No wallet configured. Set {}", var))
        })?;

        key.parse::<LocalWallet>()
            .map_err(|e| DeployerError::Config(format!("Invalid private key: {}", e)))
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    fn provider(&self, chain: &str) -> Result<Arc<ChainProvider>, ChainError> {
        self.chains.get_provider(chain).ok_or_else(|| {
            ChainError::new(
                chain,
                ChainErrorCategory::Unknown,
                "chain is not connected",
            )
        })
    }

    fn signer(&self, provider: &ChainProvider) -> SignerClient {
        let wallet = self.wallet.clone().with_chain_id(provider.evm_chain_id());
        SignerMiddleware::new(provider.http().clone(), wallet)
    }

    /// Receipt once it has the configured number of confirmations
    async fn confirmed_receipt(
        &self,
        provider: &ChainProvider,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        let chain = provider.key();
        let receipt = provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| classify_error(chain, &e.to_string()))?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(mined_at) = receipt.block_number else {
            return Ok(None);
        };

        let head = provider
            .get_block_number()
            .await
            .map_err(|e| classify_error(chain, &e.to_string()))?;
        let confirmations = head.saturating_sub(mined_at.as_u64()) + 1;

        if confirmations < provider.confirmation_blocks() {
            debug!(
                "Transaction {:?} has {} / {} confirmations on chain {}",
                hash,
                confirmations,
                provider.confirmation_blocks(),
                chain
            );
            return Ok(None);
        }

        if receipt.status == Some(U64::zero()) {
            return Err(ChainError::new(
                chain,
                ChainErrorCategory::Reverted,
                format!("transaction {} reverted", format_tx_hash(hash)),
            ));
        }

        Ok(Some(receipt))
    }

    fn deploy_receipt(
        chain: &str,
        tx_id: &str,
        receipt: &TransactionReceipt,
    ) -> Result<DeployReceipt, ChainError> {
        let address = receipt.contract_address.ok_or_else(|| {
            ChainError::new(
                chain,
                ChainErrorCategory::Unknown,
                format!("transaction {} did not create a contract", tx_id),
            )
        })?;

        Ok(DeployReceipt {
            contract_address: to_checksum(&address, None),
            tx_id: tx_id.to_string(),
        })
    }

    async fn wait_for_receipt(
        &self,
        provider: &ChainProvider,
        hash: H256,
    ) -> Result<TransactionReceipt, ChainError> {
        loop {
            if let Some(receipt) = self.confirmed_receipt(provider, hash).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(provider.poll_interval()).await;
        }
    }
}

#[async_trait]
impl ChainDeploymentClient for EvmDeploymentClient {
    async fn submit_deployment(
        &self,
        chain: &str,
        params: &TokenParams,
    ) -> Result<String, ChainError> {
        let provider = self.provider(chain)?;
        let data = self
            .artifact
            .creation_code(params, self.wallet.address())
            .map_err(|m| ChainError::new(chain, ChainErrorCategory::Unknown, m))?;
        let tx = TransactionRequest::new().data(data);

        let _guard = self.submissions.acquire(&chain.to_string()).await;
        let client = self.signer(&provider);
        let pending = client
            .send_transaction(tx, None)
            .await
            .map_err(|e| classify_error(chain, &e.to_string()))?;

        let tx_id = format_tx_hash(pending.tx_hash());
        info!(
            "Submitted {} deployment on chain {}: {}",
            params.symbol, chain, tx_id
        );
        crate::metrics::record_tx_submitted(chain);

        Ok(tx_id)
    }

    async fn await_deployment(
        &self,
        chain: &str,
        tx_id: &str,
    ) -> Result<DeployReceipt, ChainError> {
        let provider = self.provider(chain)?;
        let hash = parse_tx_hash(chain, tx_id)?;
        let receipt = self.wait_for_receipt(&provider, hash).await?;
        Self::deploy_receipt(chain, tx_id, &receipt)
    }

    async fn deployment_receipt(
        &self,
        chain: &str,
        tx_id: &str,
    ) -> Result<Option<DeployReceipt>, ChainError> {
        let provider = self.provider(chain)?;
        let hash = parse_tx_hash(chain, tx_id)?;
        match self.confirmed_receipt(&provider, hash).await? {
            Some(receipt) => Self::deploy_receipt(chain, tx_id, &receipt).map(Some),
            None => Ok(None),
        }
    }

    async fn register_peer(
        &self,
        chain: &str,
        local_address: &str,
        remote_chain: &str,
        remote_address: &str,
    ) -> Result<String, ChainError> {
        let provider = self.provider(chain)?;
        let remote = self.registry.get(remote_chain).map_err(|e| {
            ChainError::new(chain, ChainErrorCategory::Unknown, e.to_string())
        })?;
        let local = parse_address(chain, local_address)?;
        let peer = address_to_peer(parse_address(remote_chain, remote_address)?);

        let client = Arc::new(self.signer(&provider));
        let contract = TokenPeer::new(local, client);
        let call = contract.set_peer(remote.endpoint_id, peer);

        let hash = {
            let _guard = self.submissions.acquire(&chain.to_string()).await;
            let pending = call.send().await.map_err(|e| {
                warn!("setPeer on chain {} failed: {}", chain, e);
                classify_error(chain, &e.to_string())
            })?;
            pending.tx_hash()
        };
        crate::metrics::record_tx_submitted(chain);

        self.wait_for_receipt(&provider, hash).await?;
        let tx_id = format_tx_hash(hash);
        info!(
            "Registered {} ({}) as peer on chain {}: {}",
            remote_address, remote_chain, chain, tx_id
        );

        Ok(tx_id)
    }

    async fn transfer_ownership(
        &self,
        chain: &str,
        contract_address: &str,
        new_owner: &str,
    ) -> Result<String, ChainError> {
        let provider = self.provider(chain)?;
        let contract_address = parse_address(chain, contract_address)?;
        let new_owner = parse_address(chain, new_owner)?;

        let contract = TokenPeer::new(contract_address, Arc::new(self.signer(&provider)));
        let call = contract.transfer_ownership(new_owner);

        let hash = {
            let _guard = self.submissions.acquire(&chain.to_string()).await;
            let pending = call
                .send()
                .await
                .map_err(|e| classify_error(chain, &e.to_string()))?;
            pending.tx_hash()
        };
        crate::metrics::record_tx_submitted(chain);

        self.wait_for_receipt(&provider, hash).await?;
        let tx_id = format_tx_hash(hash);
        info!(
            "Transferred ownership of {:?} on chain {} to {:?}: {}",
            contract_address, chain, new_owner, tx_id
        );

        Ok(tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTIFACT: &str = r#"{
        "abi": [{
            "type": "constructor",
            "stateMutability": "nonpayable",
            "inputs": [
                {"name": "name_", "type": "string"},
                {"name": "symbol_", "type": "string"},
                {"name": "decimals_", "type": "uint8"},
                {"name": "supply_", "type": "uint256"},
                {"name": "holder_", "type": "address"},
                {"name": "owner_", "type": "address"}
            ]
        }],
        "bytecode": "0x6080604052"
    }"#;

    fn params() -> TokenParams {
        TokenParams {
            name: "Rainbow Token".to_string(),
            symbol: "RBW".to_string(),
            decimals: 18,
            total_supply: "1000".to_string(),
            holder: "0x1111111111111111111111111111111111111111".to_string(),
        }
    }

    fn deployer() -> Address {
        "0x2222222222222222222222222222222222222222".parse().unwrap()
    }

    #[test]
    fn test_classify_error() {
        let cases = [
            ("insufficient funds for gas * price + value", ChainErrorCategory::InsufficientFunds),
            ("execution reverted: OFT: not owner", ChainErrorCategory::Reverted),
            ("request timed out", ChainErrorCategory::Timeout),
            ("error sending request for url", ChainErrorCategory::Network),
            ("HTTP 429 Too Many Requests", ChainErrorCategory::Network),
            ("nonce too low", ChainErrorCategory::Network),
            ("something odd", ChainErrorCategory::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(classify_error("base", message).category, expected, "{}", message);
        }
    }

    #[test]
    fn test_artifact_creation_code_appends_constructor_args() {
        let artifact = TokenArtifact::parse(ARTIFACT).unwrap();
        let code = artifact.creation_code(&params(), deployer()).unwrap();
        assert!(code.len() > artifact.bytecode.len());
        assert_eq!(&code[..artifact.bytecode.len()], &artifact.bytecode[..]);

        // Sixth head word is the owner: the deployer wallet
        let head = artifact.bytecode.len();
        let owner_word = &code[head + 5 * 32..head + 6 * 32];
        assert!(owner_word[..12].iter().all(|b| *b == 0));
        assert_eq!(&owner_word[12..], deployer().as_bytes());
    }

    #[test]
    fn test_foundry_artifact_layout() {
        let raw = ARTIFACT.replace(
            r#""bytecode": "0x6080604052""#,
            r#""bytecode": {"object": "0x6080604052"}"#,
        );
        let artifact = TokenArtifact::parse(&raw).unwrap();
        assert_eq!(artifact.bytecode.len(), 5);
    }

    #[test]
    fn test_creation_code_rejects_bad_holder() {
        let artifact = TokenArtifact::parse(ARTIFACT).unwrap();
        let mut bad = params();
        bad.holder = "nobody".to_string();
        assert!(artifact.creation_code(&bad, deployer()).is_err());
    }

    #[test]
    fn test_address_to_peer_left_pads() {
        let address: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let peer = address_to_peer(address);
        assert!(peer[..12].iter().all(|b| *b == 0));
        assert_eq!(&peer[12..], address.as_bytes());
    }
}
