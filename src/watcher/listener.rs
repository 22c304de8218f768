use super::events::ChainEvent;
use crate::chain::abi::{decode_registry_log, RegistryLog};
use crate::chain::ChainClient;
use crate::challenge::LogPosition;
use crate::config::WatcherConfig;
use crate::error::{EngineError, Result};
use crate::store::BlockCheckpoint;
use ethers::types::{Address, H256};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

const MAX_BLOCKS_PER_POLL: u64 = 100;
/// Recent block hashes kept to locate the fork point of a reorg.
const REORG_WINDOW: usize = 128;

/// Turns registry logs into [`ChainEvent`]s. Owns the cursor of the last block
/// it queued; the watcher persists its own checkpoint as it processes.
pub(super) struct ChainListener {
    chain: Arc<dyn ChainClient>,
    registry: Address,
    config: WatcherConfig,
    recent: BTreeMap<u64, H256>,
}

impl ChainListener {
    pub(super) fn new(
        chain: Arc<dyn ChainClient>,
        registry: Address,
        config: WatcherConfig,
        checkpoint: Option<BlockCheckpoint>,
    ) -> Self {
        let mut recent = BTreeMap::new();
        if let Some(checkpoint) = checkpoint {
            recent.insert(checkpoint.number, checkpoint.hash);
        }
        Self { chain, registry, config, recent }
    }

    fn cursor(&self) -> Option<(u64, H256)> {
        self.recent.iter().next_back().map(|(n, h)| (*n, *h))
    }

    /// Queues everything between the cursor and the confirmed head.
    pub(super) async fn poll(&mut self, queue: &mpsc::UnboundedSender<ChainEvent>) -> Result<()> {
        let head = self.chain.block_number().await?.saturating_sub(self.config.confirmations);
        let from = match self.cursor() {
            Some((number, hash)) => {
                if self.chain.block_hash(number).await? != Some(hash) {
                    let ancestor = self.rewind().await?;
                    warn!("reorg detected at block {}, common ancestor {}", number, ancestor);
                    send(queue, ChainEvent::Reorg { common_ancestor: ancestor })?;
                }
                self.cursor().map(|(n, _)| n + 1).unwrap_or(0)
            }
            None => self.config.start_block.unwrap_or(head),
        };
        if from > head {
            return Ok(());
        }
        let to = head.min(from + MAX_BLOCKS_PER_POLL - 1);

        let mut logs = self.chain.get_logs(self.registry, from, to).await?;
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        let mut logs = logs.into_iter().peekable();

        for number in from..=to {
            while let Some(log) = logs.next_if(|l| l.block_number.map(|n| n.as_u64()) == Some(number)) {
                let position = LogPosition {
                    block_number: number,
                    log_index: log.log_index.map(|i| i.low_u64()).unwrap_or_default(),
                };
                match decode_registry_log(&log) {
                    Ok(Some(RegistryLog::ChallengeUpdated(log))) => {
                        send(queue, ChainEvent::ChallengeUpdated { log, position })?
                    }
                    Ok(Some(RegistryLog::StateProgressed(log))) => {
                        send(queue, ChainEvent::StateProgressed { log, position })?
                    }
                    Ok(None) => {}
                    Err(e) => warn!("skipping undecodable registry log at {:?}: {}", position, e),
                }
            }
            let hash = self
                .chain
                .block_hash(number)
                .await?
                .ok_or_else(|| EngineError::not_found("block", number))?;
            send(queue, ChainEvent::NewBlock { number, hash })?;
            self.remember(number, hash);
        }
        debug!("queued blocks {}..={}", from, to);
        Ok(())
    }

    /// Drops remembered blocks the chain no longer agrees with and returns the
    /// newest one it still does, or the block before the oldest remembered.
    async fn rewind(&mut self) -> Result<u64> {
        while let Some((number, hash)) = self.cursor() {
            if self.chain.block_hash(number).await? == Some(hash) {
                return Ok(number);
            }
            self.recent.remove(&number);
            if self.recent.is_empty() {
                let ancestor = number.saturating_sub(1);
                if let Some(hash) = self.chain.block_hash(ancestor).await? {
                    self.recent.insert(ancestor, hash);
                }
                return Ok(ancestor);
            }
        }
        Ok(0)
    }

    fn remember(&mut self, number: u64, hash: H256) {
        self.recent.insert(number, hash);
        while self.recent.len() > REORG_WINDOW {
            let oldest = self.recent.keys().next().copied();
            if let Some(oldest) = oldest {
                self.recent.remove(&oldest);
            }
        }
    }
}

fn send(queue: &mpsc::UnboundedSender<ChainEvent>, event: ChainEvent) -> Result<()> {
    queue
        .send(event)
        .map_err(|_| EngineError::Chain { operation: "queue event".into(), details: "watcher stopped".into() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::abi::OnchainChallenge;
    use crate::chain::MockChain;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ChainEvent>) -> Vec<ChainEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn logs_precede_their_block() {
        let registry = Address::repeat_byte(0xee);
        let chain = Arc::new(MockChain::new(registry));
        chain.mine_block().unwrap();
        let challenge = OnchainChallenge { status: 1, app_state_hash: H256::zero(), version_number: 1, finalizes_at: 5 };
        chain.emit_challenge_updated(H256::repeat_byte(1), challenge).unwrap();

        let config = WatcherConfig { start_block: Some(0), ..Default::default() };
        let mut listener = ChainListener::new(chain.clone(), registry, config, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.poll(&tx).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ChainEvent::NewBlock { number: 0, .. }));
        assert!(matches!(events[1], ChainEvent::ChallengeUpdated { position: LogPosition { block_number: 1, .. }, .. }));
        assert!(matches!(events[2], ChainEvent::NewBlock { number: 1, .. }));

        listener.poll(&tx).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn reorg_rewinds_to_common_ancestor() {
        let registry = Address::repeat_byte(0xee);
        let chain = Arc::new(MockChain::new(registry));
        chain.mine_blocks(4).unwrap();
        let config = WatcherConfig { start_block: Some(0), ..Default::default() };
        let mut listener = ChainListener::new(chain.clone(), registry, config, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.poll(&tx).await.unwrap();
        drain(&mut rx);

        chain.reorg(2).unwrap();
        listener.poll(&tx).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events[0], ChainEvent::Reorg { common_ancestor: 2 });
        assert!(matches!(events[1], ChainEvent::NewBlock { number: 3, .. }));
        assert!(matches!(events[2], ChainEvent::NewBlock { number: 4, .. }));
    }
}
