use super::abi::{self, OnchainChallenge};
use super::{ChainClient, InclusionReceipt};
use crate::chain_err;
use crate::error::Result;
use crate::signer::ChannelSigner;
use crate::types::MinimalTransaction;
use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, PendingTransaction, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Filter, Log, TransactionRequest, H256};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_INCLUSION_TIMEOUT: Duration = Duration::from_secs(120);

/// JSON-RPC node access through an ethers provider. Submissions are signed by
/// the channel key.
#[derive(Clone)]
pub struct ProviderChainClient {
    client: Arc<SignerMiddleware<Provider<Http>, LocalWallet>>,
    inclusion_timeout: Duration,
}

impl ProviderChainClient {
    pub async fn connect(rpc_url: &str, signer: &ChannelSigner) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url).map_err(|e| chain_err!("connect", e))?;
        let chain_id = provider.get_chainid().await.map_err(|e| chain_err!("get_chainid", e))?;
        let wallet = signer.wallet().clone().with_chain_id(chain_id.as_u64());
        info!("connected to {} chain_id={} as {:?}", rpc_url, chain_id, wallet.address());
        Ok(Self { client: Arc::new(SignerMiddleware::new(provider, wallet)), inclusion_timeout: DEFAULT_INCLUSION_TIMEOUT })
    }

    /// Longest `wait_for_inclusion` waits before giving up on a transaction.
    pub fn with_inclusion_timeout(mut self, timeout: Duration) -> Self {
        self.inclusion_timeout = timeout;
        self
    }
}

#[async_trait]
impl ChainClient for ProviderChainClient {
    async fn block_number(&self) -> Result<u64> {
        let number = self
            .client
            .get_block_number()
            .await
            .map_err(|e| chain_err!("get_block_number", e))?;
        Ok(number.as_u64())
    }

    async fn block_hash(&self, number: u64) -> Result<Option<H256>> {
        let block = self
            .client
            .get_block(number)
            .await
            .map_err(|e| chain_err!("get_block", e))?;
        Ok(block.and_then(|b| b.hash))
    }

    async fn get_logs(&self, address: Address, from_block: u64, to_block: u64) -> Result<Vec<Log>> {
        let filter = Filter::new().address(address).from_block(from_block).to_block(to_block);
        self.client.get_logs(&filter).await.map_err(|e| chain_err!("get_logs", e))
    }

    async fn get_app_challenge(&self, registry: Address, identity_hash: H256) -> Result<OnchainChallenge> {
        let tx = TransactionRequest::new().to(registry).data(abi::app_challenges(identity_hash));
        let output = self
            .client
            .call(&tx.into(), None)
            .await
            .map_err(|e| chain_err!("appChallenges", e))?;
        abi::decode_app_challenge(&output)
    }

    async fn send_transaction(&self, tx: &MinimalTransaction) -> Result<H256> {
        let request = TransactionRequest::new().to(tx.to).value(tx.value).data(tx.data.clone());
        let pending = self
            .client
            .send_transaction(request, None)
            .await
            .map_err(|e| chain_err!("send_transaction", e))?;
        let tx_hash = *pending;
        debug!("submitted {:?} to {:?}", tx_hash, tx.to);
        Ok(tx_hash)
    }

    async fn wait_for_inclusion(&self, tx_hash: H256) -> Result<InclusionReceipt> {
        let pending = PendingTransaction::new(tx_hash, self.client.provider()).interval(RECEIPT_POLL_INTERVAL);
        let receipt = tokio::time::timeout(self.inclusion_timeout, pending)
            .await
            .map_err(|_| {
                chain_err!("wait_for_inclusion", format!("{:?} not mined within {:?}", tx_hash, self.inclusion_timeout))
            })?
            .map_err(|e| chain_err!("wait_for_inclusion", e))?
            .ok_or_else(|| chain_err!("wait_for_inclusion", format!("{:?} dropped from the mempool", tx_hash)))?;
        let block_number = receipt
            .block_number
            .ok_or_else(|| chain_err!("wait_for_inclusion", format!("receipt of {:?} has no block", tx_hash)))?;
        Ok(InclusionReceipt {
            tx_hash,
            block_number: block_number.as_u64(),
            success: receipt.status.map_or(false, |s| s.as_u64() == 1),
        })
    }
}
