//! Typed persistence of channels, commitments and watcher records.
//!
//! Every record is JSON under a string key in a [`KvBackend`]. Operations that
//! touch a channel together with its commitments go out as a single batch, so
//! a reader never sees one without the other. Compound writes also hold the
//! store's own write lock; callers need not hold the channel lock.

mod backend;
mod memory;
mod migrations;
mod rocks;

pub use backend::{BatchOp, KvBackend};
pub use memory::MemoryBackend;
pub use rocks::RocksBackend;

use crate::app_instance::{AppInstance, AppProposal};
use crate::challenge::{AppChallenge, ChallengeUpdatedEvent, StateProgressedEvent};
use crate::commitments::{
    ConditionalTransactionCommitment, EthereumCommitment, SetStateCommitment, SetupCommitment, WithdrawCommitment,
};
use crate::config::{StoreBackendKind, StoreConfig};
use crate::error::{EngineError, Result};
use crate::state_channel::StateChannel;
use crate::storage_err;
use ethers::types::{Address, H256};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

pub const STORE_SCHEMA_VERSION: u32 = 2;

const SCHEMA_KEY: &str = "schema_version";
const CHANNEL: &str = "channel/";
const APP_INDEX: &str = "app_index/";
const SETUP: &str = "commitment/setup/";
const SET_STATE: &str = "commitment/set_state/";
const CONDITIONAL: &str = "commitment/conditional/";
const WITHDRAW: &str = "commitment/withdraw/";
const CHALLENGE: &str = "challenge/";
const STATE_PROGRESSED: &str = "event/state_progressed/";
const CHALLENGE_UPDATED: &str = "event/challenge_updated/";
const WATCHER_BLOCK: &str = "watcher/block";

fn id_key(prefix: &str, id: impl std::fmt::Debug) -> String {
    format!("{prefix}{id:?}")
}

fn event_key(prefix: &str, identity_hash: &H256, block: u64, log_index: u64) -> String {
    format!("{prefix}{identity_hash:?}/{block:016x}/{log_index:08x}")
}

/// Last block the watcher fully processed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockCheckpoint {
    pub number: u64,
    pub hash: H256,
}

#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    schema_version: u32,
    entries: Vec<(String, Vec<u8>)>,
}

/// Off-site copy of the store used for disaster recovery.
pub trait BackupService: Send + Sync {
    fn backup(&self, snapshot: Vec<u8>) -> Result<()>;

    /// The most recent snapshot, if any was taken.
    fn restore(&self) -> Result<Option<Vec<u8>>>;
}

#[derive(Default)]
pub struct MemoryBackupService {
    latest: Mutex<Option<Vec<u8>>>,
}

impl BackupService for MemoryBackupService {
    fn backup(&self, snapshot: Vec<u8>) -> Result<()> {
        *self.latest.lock().map_err(|_| storage_err!("backup lock", "poisoned"))? = Some(snapshot);
        Ok(())
    }

    fn restore(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.latest.lock().map_err(|_| storage_err!("backup lock", "poisoned"))?.clone())
    }
}

pub struct Store {
    backend: Arc<dyn KvBackend>,
    backups: Option<Arc<dyn BackupService>>,
    write_lock: Mutex<()>,
}

impl Store {
    /// Opens a store over `backend`, migrating records written by older versions.
    pub fn new(backend: Arc<dyn KvBackend>) -> Result<Self> {
        let store = Self { backend, backups: None, write_lock: Mutex::new(()) };
        store.maybe_run_migrations()?;
        Ok(store)
    }

    /// Opens the backend `config` names.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        match config.backend {
            StoreBackendKind::Memory => Self::in_memory(),
            StoreBackendKind::Rocksdb => Self::new(Arc::new(RocksBackend::open(&config.path)?)),
        }
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn with_backup_service(mut self, backups: Arc<dyn BackupService>) -> Self {
        self.backups = Some(backups);
        self
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| storage_err!("store write lock", "poisoned"))
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_all<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.backend
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(_, bytes)| Ok(serde_json::from_slice(&bytes)?))
            .collect()
    }

    fn read_commitment<C: EthereumCommitment>(&self, key: &str) -> Result<Option<C>> {
        match self.read::<serde_json::Value>(key)? {
            Some(value) => Ok(Some(C::from_json(value)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(key: String, value: &T) -> Result<BatchOp> {
        Ok(BatchOp::put(key, serde_json::to_vec(value)?))
    }

    fn put_commitment<C: EthereumCommitment>(key: String, commitment: &C) -> Result<BatchOp> {
        Self::put(key, &commitment.to_json()?)
    }

    // === schema ===

    pub fn get_schema_version(&self) -> Result<u32> {
        Ok(self.read::<u32>(SCHEMA_KEY)?.unwrap_or(0))
    }

    pub fn update_schema_version(&self, version: u32) -> Result<()> {
        self.backend.write(vec![Self::put(SCHEMA_KEY.to_string(), &version)?])
    }

    fn maybe_run_migrations(&self) -> Result<()> {
        let stored = self.get_schema_version()?;
        if stored == STORE_SCHEMA_VERSION {
            return Ok(());
        }
        if stored > STORE_SCHEMA_VERSION {
            return Err(storage_err!(
                "schema check",
                format!("store schema {} is newer than supported {}", stored, STORE_SCHEMA_VERSION)
            ));
        }
        if stored == 0 && self.backend.scan_prefix("")?.is_empty() {
            debug!("initialising empty store at schema {}", STORE_SCHEMA_VERSION);
            return self.update_schema_version(STORE_SCHEMA_VERSION);
        }
        info!("migrating store schema {} -> {}", stored, STORE_SCHEMA_VERSION);
        migrations::run(self, stored)
    }

    // === channels ===

    pub fn get_state_channel(&self, multisig: &Address) -> Result<Option<StateChannel>> {
        self.read(&id_key(CHANNEL, multisig))
    }

    pub fn get_all_channels(&self) -> Result<Vec<StateChannel>> {
        self.read_all(CHANNEL)
    }

    pub fn get_state_channel_by_owners(&self, owners: &[Address]) -> Result<Option<StateChannel>> {
        let mut wanted = owners.to_vec();
        wanted.sort();
        Ok(self.get_all_channels()?.into_iter().find(|c| c.multisig_owners() == wanted))
    }

    pub fn get_state_channel_by_app_identity_hash(&self, identity_hash: &H256) -> Result<Option<StateChannel>> {
        match self.read::<Address>(&id_key(APP_INDEX, identity_hash))? {
            Some(multisig) => self.get_state_channel(&multisig),
            None => Ok(None),
        }
    }

    /// Installed app or free balance by identity hash.
    pub fn get_app_instance(&self, identity_hash: &H256) -> Result<Option<AppInstance>> {
        Ok(self
            .get_state_channel_by_app_identity_hash(identity_hash)?
            .and_then(|c| c.find_app(identity_hash).cloned()))
    }

    pub fn get_app_proposal(&self, identity_hash: &H256) -> Result<Option<AppProposal>> {
        Ok(self
            .get_state_channel_by_app_identity_hash(identity_hash)?
            .and_then(|c| c.proposed_app_instances.get(identity_hash).cloned()))
    }

    pub fn get_free_balance(&self, multisig: &Address) -> Result<Option<AppInstance>> {
        Ok(self.get_state_channel(multisig)?.map(|c| c.free_balance))
    }

    pub fn create_state_channel(
        &self,
        channel: &StateChannel,
        setup: &SetupCommitment,
        free_balance_set_state: &SetStateCommitment,
    ) -> Result<()> {
        let _guard = self.lock_writes()?;
        if self.get_state_channel(&channel.multisig_address)?.is_some() {
            return Err(EngineError::Validation(format!(
                "channel {:?} already exists",
                channel.multisig_address
            )));
        }
        let fb = channel.free_balance.identity_hash;
        self.backend.write(vec![
            Self::put(id_key(CHANNEL, channel.multisig_address), channel)?,
            Self::put(id_key(APP_INDEX, fb), &channel.multisig_address)?,
            Self::put_commitment(id_key(SETUP, channel.multisig_address), setup)?,
            Self::put_commitment(id_key(SET_STATE, fb), free_balance_set_state)?,
        ])
    }

    /// Persists `channel` (already holding the proposal) with the proposal's
    /// initial set-state commitment.
    pub fn create_app_proposal(
        &self,
        channel: &StateChannel,
        proposal: &AppProposal,
        set_state: &SetStateCommitment,
    ) -> Result<()> {
        let _guard = self.lock_writes()?;
        channel.get_proposal(&proposal.identity_hash)?;
        self.require_channel(&channel.multisig_address)?;
        self.backend.write(vec![
            Self::put(id_key(CHANNEL, channel.multisig_address), channel)?,
            Self::put(id_key(APP_INDEX, proposal.identity_hash), &channel.multisig_address)?,
            Self::put_commitment(id_key(SET_STATE, proposal.identity_hash), set_state)?,
        ])
    }

    /// Persists `channel` after installing `identity_hash`, together with the
    /// new free balance state and the app's conditional transaction.
    pub fn create_app_instance(
        &self,
        channel: &StateChannel,
        identity_hash: &H256,
        free_balance_set_state: &SetStateCommitment,
        conditional: &ConditionalTransactionCommitment,
    ) -> Result<()> {
        let _guard = self.lock_writes()?;
        channel.get_app_instance(identity_hash)?;
        self.require_channel(&channel.multisig_address)?;
        self.backend.write(vec![
            Self::put(id_key(CHANNEL, channel.multisig_address), channel)?,
            Self::put_commitment(id_key(SET_STATE, channel.free_balance.identity_hash), free_balance_set_state)?,
            Self::put_commitment(id_key(CONDITIONAL, identity_hash), conditional)?,
        ])
    }

    pub fn update_app_instance(
        &self,
        channel: &StateChannel,
        app: &AppInstance,
        set_state: &SetStateCommitment,
    ) -> Result<()> {
        let _guard = self.lock_writes()?;
        channel.get_app_instance(&app.identity_hash)?;
        self.require_channel(&channel.multisig_address)?;
        self.backend.write(vec![
            Self::put(id_key(CHANNEL, channel.multisig_address), channel)?,
            Self::put_commitment(id_key(SET_STATE, app.identity_hash), set_state)?,
        ])
    }

    /// Persists `channel` after uninstalling `identity_hash`. The app's
    /// commitments go, its challenge history stays.
    pub fn remove_app_instance(
        &self,
        channel: &StateChannel,
        identity_hash: &H256,
        free_balance_set_state: &SetStateCommitment,
    ) -> Result<()> {
        let _guard = self.lock_writes()?;
        if channel.app_instances.contains_key(identity_hash) {
            return Err(EngineError::Validation(format!(
                "app {:?} is still installed in the channel being written",
                identity_hash
            )));
        }
        self.require_channel(&channel.multisig_address)?;
        self.backend.write(vec![
            Self::put(id_key(CHANNEL, channel.multisig_address), channel)?,
            Self::put_commitment(id_key(SET_STATE, channel.free_balance.identity_hash), free_balance_set_state)?,
            BatchOp::delete(id_key(APP_INDEX, identity_hash)),
            BatchOp::delete(id_key(SET_STATE, identity_hash)),
            BatchOp::delete(id_key(CONDITIONAL, identity_hash)),
        ])
    }

    /// Overwrites a channel record outside any protocol, e.g. after recording
    /// a deposit. The channel must already exist.
    pub fn save_state_channel(&self, channel: &StateChannel) -> Result<()> {
        let _guard = self.lock_writes()?;
        self.require_channel(&channel.multisig_address)?;
        self.backend.write(vec![Self::put(id_key(CHANNEL, channel.multisig_address), channel)?])
    }

    fn require_channel(&self, multisig: &Address) -> Result<StateChannel> {
        self.get_state_channel(multisig)?
            .ok_or_else(|| EngineError::not_found("state channel", multisig))
    }

    // === commitments ===

    pub fn get_setup_commitment(&self, multisig: &Address) -> Result<Option<SetupCommitment>> {
        self.read_commitment(&id_key(SETUP, multisig))
    }

    pub fn get_set_state_commitment(&self, identity_hash: &H256) -> Result<Option<SetStateCommitment>> {
        self.read_commitment(&id_key(SET_STATE, identity_hash))
    }

    pub fn get_conditional_transaction_commitment(
        &self,
        identity_hash: &H256,
    ) -> Result<Option<ConditionalTransactionCommitment>> {
        self.read_commitment(&id_key(CONDITIONAL, identity_hash))
    }

    pub fn save_withdrawal_commitment(&self, multisig: &Address, commitment: &WithdrawCommitment) -> Result<()> {
        commitment.assert_signatures()?;
        let _guard = self.lock_writes()?;
        self.require_channel(multisig)?;
        self.backend.write(vec![Self::put_commitment(id_key(WITHDRAW, multisig), commitment)?])
    }

    pub fn get_withdrawal_commitment(&self, multisig: &Address) -> Result<Option<WithdrawCommitment>> {
        self.read_commitment(&id_key(WITHDRAW, multisig))
    }

    // === watcher records ===

    pub fn get_app_challenge(&self, identity_hash: &H256) -> Result<Option<AppChallenge>> {
        self.read(&id_key(CHALLENGE, identity_hash))
    }

    pub fn save_app_challenge(&self, challenge: &AppChallenge) -> Result<()> {
        let op = Self::put(id_key(CHALLENGE, challenge.identity_hash), challenge)?;
        let _guard = self.lock_writes()?;
        self.backend.write(vec![op])
    }

    pub fn get_all_challenges(&self) -> Result<Vec<AppChallenge>> {
        self.read_all(CHALLENGE)
    }

    pub fn get_active_challenges(&self) -> Result<Vec<AppChallenge>> {
        Ok(self
            .get_all_challenges()?
            .into_iter()
            .filter(|c| !c.status.is_terminal())
            .collect())
    }

    /// Appends to the log; the same log position is stored once.
    pub fn create_state_progressed_event(&self, event: &StateProgressedEvent) -> Result<()> {
        let key = event_key(
            STATE_PROGRESSED,
            &event.identity_hash,
            event.position.block_number,
            event.position.log_index,
        );
        let op = Self::put(key, event)?;
        let _guard = self.lock_writes()?;
        self.backend.write(vec![op])
    }

    pub fn get_state_progressed_events(&self, identity_hash: &H256) -> Result<Vec<StateProgressedEvent>> {
        self.read_all(&id_key(STATE_PROGRESSED, identity_hash))
    }

    pub fn create_challenge_updated_event(&self, event: &ChallengeUpdatedEvent) -> Result<()> {
        let key = event_key(
            CHALLENGE_UPDATED,
            &event.identity_hash,
            event.position.block_number,
            event.position.log_index,
        );
        let op = Self::put(key, event)?;
        let _guard = self.lock_writes()?;
        self.backend.write(vec![op])
    }

    pub fn get_challenge_updated_events(&self, identity_hash: &H256) -> Result<Vec<ChallengeUpdatedEvent>> {
        self.read_all(&id_key(CHALLENGE_UPDATED, identity_hash))
    }

    pub fn get_latest_processed_block(&self) -> Result<Option<BlockCheckpoint>> {
        self.read(WATCHER_BLOCK)
    }

    pub fn update_latest_processed_block(&self, checkpoint: &BlockCheckpoint) -> Result<()> {
        let op = Self::put(WATCHER_BLOCK.to_string(), checkpoint)?;
        let _guard = self.lock_writes()?;
        self.backend.write(vec![op])
    }

    // === backup ===

    /// Wipes every record, including the schema version.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock_writes()?;
        warn!("clearing store");
        self.backend.clear()
    }

    /// Snapshot of the whole store, handed to the backup service when one is set.
    pub fn backup(&self) -> Result<Vec<u8>> {
        let _guard = self.lock_writes()?;
        let snapshot = StoreSnapshot {
            schema_version: self.get_schema_version()?,
            entries: self.backend.scan_prefix("")?,
        };
        let bytes = bincode::serialize(&snapshot)?;
        if let Some(backups) = &self.backups {
            backups.backup(bytes.clone())?;
        }
        debug!("store backup taken entries={}", snapshot.entries.len());
        Ok(bytes)
    }

    /// Replaces the store's content with the backup service's latest snapshot.
    pub fn restore(&self) -> Result<()> {
        let backups = self
            .backups
            .as_ref()
            .ok_or_else(|| EngineError::Config("no backup service configured".into()))?;
        let snapshot = backups.restore()?.ok_or_else(|| EngineError::not_found("backup", "latest"))?;
        self.restore_from(&snapshot)
    }

    /// Replaces the store's content with `snapshot` in a single batch, so a
    /// failed restore leaves the previous content in place.
    pub fn restore_from(&self, snapshot: &[u8]) -> Result<()> {
        let snapshot: StoreSnapshot = bincode::deserialize(snapshot)?;
        {
            let _guard = self.lock_writes()?;
            let keep: HashSet<&str> = snapshot.entries.iter().map(|(key, _)| key.as_str()).collect();
            let mut batch: Vec<BatchOp> = self
                .backend
                .scan_prefix("")?
                .into_iter()
                .filter(|(key, _)| !keep.contains(key.as_str()))
                .map(|(key, _)| BatchOp::delete(key))
                .collect();
            batch.extend(snapshot.entries.iter().map(|(key, value)| BatchOp::put(key.clone(), value.clone())));
            self.backend.write(batch)?;
        }
        info!("store restored from backup schema={}", snapshot.schema_version);
        self.maybe_run_migrations()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }
}
