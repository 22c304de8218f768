use crate::chain::abi::{OnchainChallenge, StateProgressedLog};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeStatus {
    NoChallenge,
    InDispute,
    InOnchainProgression,
    ExplicitlyFinalized,
    OutcomeSet,
    ConditionalSent,
}

impl ChallengeStatus {
    /// Maps the registry's `uint8` status. `ConditionalSent` only exists off chain.
    pub fn from_onchain(status: u8) -> Option<Self> {
        match status {
            0 => Some(ChallengeStatus::NoChallenge),
            1 => Some(ChallengeStatus::InDispute),
            2 => Some(ChallengeStatus::InOnchainProgression),
            3 => Some(ChallengeStatus::ExplicitlyFinalized),
            4 => Some(ChallengeStatus::OutcomeSet),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChallengeStatus::ConditionalSent)
    }

    /// Statuses in which the registry accepts new states until `finalizes_at`.
    pub fn is_open(&self) -> bool {
        matches!(self, ChallengeStatus::InDispute | ChallengeStatus::InOnchainProgression)
    }
}

/// The watcher's view of an app's dispute.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppChallenge {
    pub identity_hash: H256,
    pub status: ChallengeStatus,
    pub app_state_hash: H256,
    pub version_number: u64,
    pub finalizes_at: u64,
}

impl AppChallenge {
    pub fn from_onchain(identity_hash: H256, onchain: &OnchainChallenge) -> Option<Self> {
        Some(Self {
            identity_hash,
            status: ChallengeStatus::from_onchain(onchain.status)?,
            app_state_hash: onchain.app_state_hash,
            version_number: onchain.version_number,
            finalizes_at: onchain.finalizes_at,
        })
    }

    /// Whether `next` moves this challenge forward. Stale or replayed updates
    /// compare lower and are dropped.
    pub fn is_advanced_by(&self, next: &AppChallenge) -> bool {
        (next.version_number, next.status) > (self.version_number, self.status)
            || (next.version_number == self.version_number
                && next.status == self.status
                && next.finalizes_at > self.finalizes_at)
    }
}

/// Position of a log on chain, orders every watcher record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct LogPosition {
    pub block_number: u64,
    pub log_index: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateProgressedEvent {
    pub identity_hash: H256,
    pub action: Bytes,
    pub version_number: u64,
    pub timeout: U256,
    pub turn_taker: Address,
    pub signature: Bytes,
    pub position: LogPosition,
}

impl StateProgressedEvent {
    pub fn from_log(log: StateProgressedLog, position: LogPosition) -> Self {
        Self {
            identity_hash: log.identity_hash,
            action: log.action,
            version_number: log.version_number,
            timeout: log.timeout,
            turn_taker: log.turn_taker,
            signature: log.signature,
            position,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeUpdatedEvent {
    pub identity_hash: H256,
    pub status: ChallengeStatus,
    pub app_state_hash: H256,
    pub version_number: u64,
    pub finalizes_at: u64,
    pub position: LogPosition,
}

impl ChallengeUpdatedEvent {
    pub fn from_challenge(challenge: &AppChallenge, position: LogPosition) -> Self {
        Self {
            identity_hash: challenge.identity_hash,
            status: challenge.status,
            app_state_hash: challenge.app_state_hash,
            version_number: challenge.version_number,
            finalizes_at: challenge.finalizes_at,
            position,
        }
    }
}
