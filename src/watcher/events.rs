use crate::chain::abi::{ChallengeUpdatedLog, StateProgressedLog};
use crate::challenge::{AppChallenge, LogPosition, StateProgressedEvent};
use ethers::types::H256;
use serde::Serialize;

/// Typed chain input to the watcher, in block and log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    ChallengeUpdated { log: ChallengeUpdatedLog, position: LogPosition },
    StateProgressed { log: StateProgressedLog, position: LogPosition },
    /// Every log of block `number` has been queued before this.
    NewBlock { number: u64, hash: H256 },
    /// Blocks above `common_ancestor` were replaced.
    Reorg { common_ancestor: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WatcherEvent {
    ChallengeUpdated { challenge: AppChallenge },
    StateProgressed { event: StateProgressedEvent },
    ChallengeProgressed { identity_hash: H256, version_number: u64, tx_hash: H256 },
    ChallengeProgressionFailed { identity_hash: H256, error: String },
    ChallengeOutcomeSet { identity_hash: H256, tx_hash: H256 },
    ChallengeOutcomeFailed { identity_hash: H256, error: String },
    ChallengeCompleted { identity_hash: H256, tx_hash: H256 },
    ChallengeCompletionFailed { identity_hash: H256, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatcherEventKind {
    ChallengeUpdated,
    StateProgressed,
    ChallengeProgressed,
    ChallengeProgressionFailed,
    ChallengeOutcomeSet,
    ChallengeOutcomeFailed,
    ChallengeCompleted,
    ChallengeCompletionFailed,
}

impl WatcherEvent {
    pub fn kind(&self) -> WatcherEventKind {
        match self {
            WatcherEvent::ChallengeUpdated { .. } => WatcherEventKind::ChallengeUpdated,
            WatcherEvent::StateProgressed { .. } => WatcherEventKind::StateProgressed,
            WatcherEvent::ChallengeProgressed { .. } => WatcherEventKind::ChallengeProgressed,
            WatcherEvent::ChallengeProgressionFailed { .. } => WatcherEventKind::ChallengeProgressionFailed,
            WatcherEvent::ChallengeOutcomeSet { .. } => WatcherEventKind::ChallengeOutcomeSet,
            WatcherEvent::ChallengeOutcomeFailed { .. } => WatcherEventKind::ChallengeOutcomeFailed,
            WatcherEvent::ChallengeCompleted { .. } => WatcherEventKind::ChallengeCompleted,
            WatcherEvent::ChallengeCompletionFailed { .. } => WatcherEventKind::ChallengeCompletionFailed,
        }
    }

    pub fn identity_hash(&self) -> H256 {
        match self {
            WatcherEvent::ChallengeUpdated { challenge } => challenge.identity_hash,
            WatcherEvent::StateProgressed { event } => event.identity_hash,
            WatcherEvent::ChallengeProgressed { identity_hash, .. }
            | WatcherEvent::ChallengeProgressionFailed { identity_hash, .. }
            | WatcherEvent::ChallengeOutcomeSet { identity_hash, .. }
            | WatcherEvent::ChallengeOutcomeFailed { identity_hash, .. }
            | WatcherEvent::ChallengeCompleted { identity_hash, .. }
            | WatcherEvent::ChallengeCompletionFailed { identity_hash, .. } => *identity_hash,
        }
    }
}
