pub mod abi;
pub mod mock;
mod provider;

pub use mock::MockChain;
pub use provider::ProviderChainClient;

use crate::error::Result;
use crate::types::MinimalTransaction;
use abi::OnchainChallenge;
use async_trait::async_trait;
use ethers::types::{Address, Log, H256};

/// Outcome of a submitted transaction once mined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InclusionReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub success: bool,
}

/// The slice of an Ethereum node the watcher needs.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    /// `None` for blocks past the head.
    async fn block_hash(&self, number: u64) -> Result<Option<H256>>;

    /// Logs emitted by `address` in `from_block..=to_block`, in chain order.
    async fn get_logs(&self, address: Address, from_block: u64, to_block: u64) -> Result<Vec<Log>>;

    async fn get_app_challenge(&self, registry: Address, identity_hash: H256) -> Result<OnchainChallenge>;

    async fn send_transaction(&self, tx: &MinimalTransaction) -> Result<H256>;

    async fn wait_for_inclusion(&self, tx_hash: H256) -> Result<InclusionReceipt>;
}
