//! In-memory chain for tests and dry runs.
//!
//! Blocks are mined on demand. Registry logs are emitted by the caller, the
//! mock does not execute calldata: submitted transactions are recorded and
//! included in the current head, succeeding unless their selector was marked
//! to revert.

use super::abi::{self, ChallengeUpdatedLog, OnchainChallenge, StateProgressedLog};
use super::{ChainClient, InclusionReceipt};
use crate::error::Result;
use crate::storage_err;
use crate::types::{hash_bytes, MinimalTransaction};
use async_trait::async_trait;
use ethers::types::{Address, Log, H256, U256, U64};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MockState {
    /// Hash of block `n` at index `n`.
    blocks: Vec<H256>,
    forks: u64,
    logs: Vec<Log>,
    challenges: HashMap<H256, OnchainChallenge>,
    submitted: Vec<MinimalTransaction>,
    receipts: HashMap<H256, InclusionReceipt>,
    reverting: HashSet<[u8; 4]>,
}

impl MockState {
    fn head(&self) -> u64 {
        self.blocks.len().saturating_sub(1) as u64
    }

    fn mine(&mut self) -> u64 {
        let number = self.blocks.len() as u64;
        let mut seed = number.to_be_bytes().to_vec();
        seed.extend_from_slice(&self.forks.to_be_bytes());
        self.blocks.push(hash_bytes(&seed));
        number
    }

    fn push_log(&mut self, registry: Address, topics: Vec<H256>, data: ethers::types::Bytes) {
        let block = self.head();
        let log_index = self
            .logs
            .iter()
            .filter(|l| l.block_number == Some(U64::from(block)))
            .count();
        self.logs.push(Log {
            address: registry,
            topics,
            data,
            block_number: Some(U64::from(block)),
            block_hash: self.blocks.get(block as usize).copied(),
            log_index: Some(U256::from(log_index)),
            ..Default::default()
        });
    }
}

pub struct MockChain {
    registry: Address,
    state: Mutex<MockState>,
}

impl MockChain {
    /// A chain whose genesis block is already mined.
    pub fn new(registry: Address) -> Self {
        let mut state = MockState::default();
        state.mine();
        Self { registry, state: Mutex::new(state) }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state.lock().map_err(|_| storage_err!("mock chain lock", "poisoned"))
    }

    pub fn mine_block(&self) -> Result<u64> {
        Ok(self.lock_state()?.mine())
    }

    pub fn mine_blocks(&self, count: u64) -> Result<u64> {
        let mut state = self.lock_state()?;
        for _ in 0..count {
            state.mine();
        }
        Ok(state.head())
    }

    pub fn head(&self) -> Result<u64> {
        Ok(self.lock_state()?.head())
    }

    /// Records the challenge and emits its `ChallengeUpdated` log in the head block.
    pub fn emit_challenge_updated(&self, identity_hash: H256, challenge: OnchainChallenge) -> Result<()> {
        let mut state = self.lock_state()?;
        state.challenges.insert(identity_hash, challenge);
        let (topics, data) = abi::encode_challenge_updated(&ChallengeUpdatedLog { identity_hash, challenge });
        state.push_log(self.registry, topics, data);
        Ok(())
    }

    pub fn emit_state_progressed(&self, progressed: &StateProgressedLog) -> Result<()> {
        let mut state = self.lock_state()?;
        let (topics, data) = abi::encode_state_progressed(progressed);
        state.push_log(self.registry, topics, data);
        Ok(())
    }

    /// Overwrites the registry's record without emitting a log.
    pub fn set_app_challenge(&self, identity_hash: H256, challenge: OnchainChallenge) -> Result<()> {
        self.lock_state()?.challenges.insert(identity_hash, challenge);
        Ok(())
    }

    /// Replaces the last `depth` blocks with a fork of the same height, dropping
    /// their logs.
    pub fn reorg(&self, depth: u64) -> Result<()> {
        let mut state = self.lock_state()?;
        let head = state.head();
        let keep = head.saturating_sub(depth) + 1;
        state.forks += 1;
        state.blocks.truncate(keep as usize);
        state.logs.retain(|l| l.block_number.map(|n| n.as_u64() < keep).unwrap_or(false));
        while state.head() < head {
            state.mine();
        }
        Ok(())
    }

    /// Transactions with this selector are included but revert.
    pub fn revert_calls_to(&self, signature: &str) -> Result<()> {
        let selector = ethers::utils::id(signature);
        self.lock_state()?.reverting.insert(selector);
        Ok(())
    }

    pub fn stop_reverting(&self) -> Result<()> {
        self.lock_state()?.reverting.clear();
        Ok(())
    }

    pub fn submitted(&self) -> Result<Vec<MinimalTransaction>> {
        Ok(self.lock_state()?.submitted.clone())
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64> {
        self.head()
    }

    async fn block_hash(&self, number: u64) -> Result<Option<H256>> {
        Ok(self.lock_state()?.blocks.get(number as usize).copied())
    }

    async fn get_logs(&self, address: Address, from_block: u64, to_block: u64) -> Result<Vec<Log>> {
        Ok(self
            .lock_state()?
            .logs
            .iter()
            .filter(|l| l.address == address)
            .filter(|l| {
                l.block_number
                    .map(|n| (from_block..=to_block).contains(&n.as_u64()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn get_app_challenge(&self, _registry: Address, identity_hash: H256) -> Result<OnchainChallenge> {
        Ok(self.lock_state()?.challenges.get(&identity_hash).copied().unwrap_or(OnchainChallenge {
            status: 0,
            app_state_hash: H256::zero(),
            version_number: 0,
            finalizes_at: 0,
        }))
    }

    async fn send_transaction(&self, tx: &MinimalTransaction) -> Result<H256> {
        let mut state = self.lock_state()?;
        let mut seed = tx.data.to_vec();
        seed.extend_from_slice(&(state.submitted.len() as u64).to_be_bytes());
        let tx_hash = hash_bytes(&seed);
        let success = abi::selector_of(&tx.data).map_or(true, |s| !state.reverting.contains(&s));
        let block_number = state.head();
        state.submitted.push(tx.clone());
        state.receipts.insert(tx_hash, InclusionReceipt { tx_hash, block_number, success });
        Ok(tx_hash)
    }

    async fn wait_for_inclusion(&self, tx_hash: H256) -> Result<InclusionReceipt> {
        self.lock_state()?
            .receipts
            .get(&tx_hash)
            .copied()
            .ok_or_else(|| crate::error::EngineError::not_found("transaction", tx_hash))
    }
}
