//! Dispute watcher.
//!
//! A listener task polls the challenge registry's logs into a queue and one
//! processor task applies them in order: each app's [`AppChallenge`] advances
//! through the registry's statuses and the watcher answers with the stored
//! commitments. Waiting on a dispute is driven by block height, never by the
//! wall clock. Errors in the background tasks are logged and reported as
//! [`WatcherEvent`]s, never propagated. A response that failed, or whose
//! transaction a reorg may have dropped, is sent again on a later block.

mod events;
mod listener;

pub use events::{ChainEvent, WatcherEvent, WatcherEventKind};

use crate::app_instance::AppInstance;
use crate::apps::AppRegistry;
use crate::chain::abi;
use crate::chain::{ChainClient, InclusionReceipt};
use crate::challenge::{AppChallenge, ChallengeStatus, ChallengeUpdatedEvent, StateProgressedEvent};
use crate::commitments::EthereumCommitment;
use crate::config::WatcherConfig;
use crate::error::{EngineError, Result};
use crate::state_channel::StateChannel;
use crate::store::{BlockCheckpoint, Store};
use crate::types::{hash_bytes, MinimalTransaction, NetworkContext};
use ethers::types::{Bytes, H256, U256};
use futures::future::try_join_all;
use listener::ChainListener;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

/// Submissions that land at most once per challenge version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Response {
    Progress,
    SetOutcome,
    Complete,
}

struct Running {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct WatcherInner {
    chain: Arc<dyn ChainClient>,
    store: Arc<Store>,
    network: NetworkContext,
    apps: Arc<AppRegistry>,
    events: broadcast::Sender<WatcherEvent>,
    /// Serializes event handling between the processor task and `process_event`.
    processing: Mutex<()>,
    /// Responses whose transaction was mined successfully.
    answered: StdMutex<HashSet<(H256, Response, u64)>>,
}

pub struct Watcher {
    inner: Arc<WatcherInner>,
    config: WatcherConfig,
    running: Mutex<Option<Running>>,
}

impl Watcher {
    /// `apps` replays actions the counterparty progressed on chain.
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<Store>,
        network: NetworkContext,
        apps: Arc<AppRegistry>,
        config: WatcherConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = WatcherInner {
            chain,
            store,
            network,
            apps,
            events,
            processing: Mutex::new(()),
            answered: StdMutex::new(HashSet::new()),
        };
        Self { inner: Arc::new(inner), config, running: Mutex::new(None) }
    }

    /// Spawns the listener and processor tasks. Starting twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let checkpoint = self.inner.store.get_latest_processed_block()?;
        let mut listener = ChainListener::new(
            self.inner.chain.clone(),
            self.inner.network.challenge_registry,
            self.config.clone(),
            checkpoint,
        );
        let (stop, mut stop_listener) = watch::channel(false);
        let mut stop_processor = stop.subscribe();
        let (queue, mut queued) = mpsc::unbounded_channel();

        let poll_interval = self.config.poll_interval();
        let listen = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = stop_listener.changed() => return,
                    _ = interval.tick() => {
                        if let Err(e) = listener.poll(&queue).await {
                            error!("watcher poll failed: {}", e);
                        }
                    }
                }
            }
        });

        let inner = self.inner.clone();
        let process = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_processor.changed() => return,
                    event = queued.recv() => match event {
                        Some(event) => {
                            if let Err(e) = inner.process(event).await {
                                error!("watcher failed to process chain event: {}", e);
                            }
                        }
                        None => return,
                    }
                }
            }
        });

        info!(
            "watcher started registry={:?} checkpoint={:?}",
            self.inner.network.challenge_registry,
            checkpoint.map(|c| c.number)
        );
        *running = Some(Running { stop, tasks: vec![listen, process] });
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(running) = self.running.lock().await.take() {
            let _ = running.stop.send(true);
            for task in running.tasks {
                if let Err(e) = task.await {
                    warn!("watcher task ended abnormally: {}", e);
                }
            }
            info!("watcher stopped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatcherEvent> {
        self.inner.events.subscribe()
    }

    /// First event of `kind` matching `predicate` emitted after this call.
    pub async fn wait_for<P>(&self, kind: WatcherEventKind, timeout: Duration, predicate: P) -> Result<WatcherEvent>
    where
        P: Fn(&WatcherEvent) -> bool,
    {
        let mut events = self.subscribe();
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.kind() == kind && predicate(&event) => return Ok(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("wait_for lagged, {} events skipped", skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(EngineError::Chain {
                            operation: "wait_for".into(),
                            details: "event stream closed".into(),
                        })
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| EngineError::Chain {
            operation: "wait_for".into(),
            details: format!("no {:?} event within {:?}", kind, timeout),
        })?
    }

    /// Applies one chain event as if the listener had queued it.
    pub async fn process_event(&self, event: ChainEvent) -> Result<()> {
        self.inner.process(event).await
    }

    /// Starts disputes for an installed app and its channel's free balance by
    /// submitting their latest set-state commitments. Returns the transaction
    /// hashes.
    pub async fn initiate(&self, identity_hash: H256) -> Result<Vec<H256>> {
        let inner = &self.inner;
        let channel = inner.channel_of(&identity_hash)?;
        channel.get_app_instance(&identity_hash)?;
        let mut submitted = Vec::new();
        for target in [identity_hash, channel.free_balance.identity_hash] {
            let commitment = inner
                .store
                .get_set_state_commitment(&target)?
                .ok_or_else(|| EngineError::not_found("set state commitment", target))?;
            commitment.assert_signatures()?;
            let receipt = inner.submit(&commitment.transaction()?).await?;
            if !receipt.success {
                return Err(EngineError::Chain {
                    operation: "setState".into(),
                    details: format!("transaction {:?} reverted", receipt.tx_hash),
                });
            }
            info!("dispute initiated for {:?} at version {}", target, commitment.version_number);
            submitted.push(receipt.tx_hash);
        }
        Ok(submitted)
    }
}

impl WatcherInner {
    fn emit(&self, event: WatcherEvent) {
        debug!("watcher event {:?}", event.kind());
        let _ = self.events.send(event);
    }

    fn channel_of(&self, identity_hash: &H256) -> Result<StateChannel> {
        self.store
            .get_state_channel_by_app_identity_hash(identity_hash)?
            .ok_or_else(|| EngineError::not_found("channel for app", identity_hash))
    }

    fn app_of(&self, identity_hash: &H256) -> Result<(StateChannel, AppInstance)> {
        let channel = self.channel_of(identity_hash)?;
        let app = channel
            .find_app(identity_hash)
            .cloned()
            .ok_or_else(|| EngineError::not_found("app instance", identity_hash))?;
        Ok((channel, app))
    }

    async fn submit(&self, tx: &MinimalTransaction) -> Result<InclusionReceipt> {
        let tx_hash = self.chain.send_transaction(tx).await?;
        self.chain.wait_for_inclusion(tx_hash).await
    }

    fn is_answered(&self, identity_hash: H256, response: Response, version: u64) -> bool {
        match self.answered.lock() {
            Ok(answered) => answered.contains(&(identity_hash, response, version)),
            Err(_) => true,
        }
    }

    fn record_answer(&self, identity_hash: H256, response: Response, version: u64) {
        if let Ok(mut answered) = self.answered.lock() {
            answered.insert((identity_hash, response, version));
        }
    }

    /// Forgets every mined response for these apps, a reorg may have dropped them.
    fn forget_answers(&self, identity_hashes: &HashSet<H256>) {
        if let Ok(mut answered) = self.answered.lock() {
            answered.retain(|(id, _, _)| !identity_hashes.contains(id));
        }
    }

    async fn process(&self, event: ChainEvent) -> Result<()> {
        let _processing = self.processing.lock().await;
        match event {
            ChainEvent::ChallengeUpdated { log, position } => {
                let challenge = match AppChallenge::from_onchain(log.identity_hash, &log.challenge) {
                    Some(challenge) => challenge,
                    None => {
                        warn!("unknown challenge status {} for {:?}", log.challenge.status, log.identity_hash);
                        return Ok(());
                    }
                };
                self.store
                    .create_challenge_updated_event(&ChallengeUpdatedEvent::from_challenge(&challenge, position))?;
                let current = self.store.get_app_challenge(&challenge.identity_hash)?;
                if let Some(current) = &current {
                    if current.status.is_terminal() || !current.is_advanced_by(&challenge) {
                        debug!("ignoring stale challenge update for {:?}", challenge.identity_hash);
                        return Ok(());
                    }
                }
                self.store.save_app_challenge(&challenge)?;
                self.emit(WatcherEvent::ChallengeUpdated { challenge: challenge.clone() });
                self.respond(&challenge, position.block_number).await
            }
            ChainEvent::StateProgressed { log, position } => {
                let event = StateProgressedEvent::from_log(log, position);
                self.store.create_state_progressed_event(&event)?;
                self.emit(WatcherEvent::StateProgressed { event });
                Ok(())
            }
            ChainEvent::NewBlock { number, hash } => {
                self.store.update_latest_processed_block(&BlockCheckpoint { number, hash })?;
                for challenge in self.store.get_active_challenges()? {
                    self.respond(&challenge, number).await?;
                }
                Ok(())
            }
            ChainEvent::Reorg { common_ancestor } => {
                warn!("resyncing challenges after reorg to block {}", common_ancestor);
                if let Some(hash) = self.chain.block_hash(common_ancestor).await? {
                    self.store
                        .update_latest_processed_block(&BlockCheckpoint { number: common_ancestor, hash })?;
                }
                let tracked = self.store.get_all_challenges()?;
                let onchain = try_join_all(
                    tracked
                        .iter()
                        .map(|c| self.chain.get_app_challenge(self.network.challenge_registry, c.identity_hash)),
                )
                .await?;
                self.forget_answers(&tracked.iter().map(|c| c.identity_hash).collect());
                for (tracked, onchain) in tracked.into_iter().zip(onchain) {
                    let synced = match AppChallenge::from_onchain(tracked.identity_hash, &onchain) {
                        Some(challenge) if is_still_completed(&tracked, &challenge) => tracked,
                        Some(challenge) if challenge != tracked => {
                            self.store.save_app_challenge(&challenge)?;
                            self.emit(WatcherEvent::ChallengeUpdated { challenge: challenge.clone() });
                            challenge
                        }
                        Some(_) => tracked,
                        None => {
                            warn!("unknown challenge status {} for {:?}", onchain.status, tracked.identity_hash);
                            continue;
                        }
                    };
                    self.respond(&synced, common_ancestor).await?;
                }
                Ok(())
            }
        }
    }

    /// Answers a challenge at block height `block`.
    async fn respond(&self, challenge: &AppChallenge, block: u64) -> Result<()> {
        match challenge.status {
            ChallengeStatus::InDispute | ChallengeStatus::InOnchainProgression if block >= challenge.finalizes_at => {
                self.set_outcome(challenge).await
            }
            ChallengeStatus::InDispute => self.progress(challenge).await,
            ChallengeStatus::ExplicitlyFinalized => self.set_outcome(challenge).await,
            ChallengeStatus::OutcomeSet => self.complete(challenge).await,
            ChallengeStatus::InOnchainProgression | ChallengeStatus::NoChallenge | ChallengeStatus::ConditionalSent => {
                Ok(())
            }
        }
    }

    /// Answers a dispute on a stale state with the newer signed state we hold.
    async fn progress(&self, challenge: &AppChallenge) -> Result<()> {
        let id = challenge.identity_hash;
        let commitment = match self.store.get_set_state_commitment(&id)? {
            Some(commitment) if commitment.version_number > challenge.version_number => commitment,
            _ => return Ok(()),
        };
        if self.is_answered(id, Response::Progress, commitment.version_number) {
            return Ok(());
        }
        info!(
            "progressing dispute on {:?} from version {} to {}",
            id, challenge.version_number, commitment.version_number
        );
        let result = match commitment.assert_signatures().and_then(|_| commitment.transaction()) {
            Ok(tx) => self.submit(&tx).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(receipt) if receipt.success => {
                self.record_answer(id, Response::Progress, commitment.version_number);
                self.emit(WatcherEvent::ChallengeProgressed {
                    identity_hash: id,
                    version_number: commitment.version_number,
                    tx_hash: receipt.tx_hash,
                })
            }
            Ok(receipt) => self.emit(WatcherEvent::ChallengeProgressionFailed {
                identity_hash: id,
                error: format!("transaction {:?} reverted", receipt.tx_hash),
            }),
            Err(e) => {
                error!("failed to progress dispute on {:?}: {}", id, e);
                self.emit(WatcherEvent::ChallengeProgressionFailed { identity_hash: id, error: e.to_string() })
            }
        }
        Ok(())
    }

    /// The state the registry holds for `challenge`: the stored state, advanced
    /// by any actions progressed on chain since its version.
    fn onchain_state(&self, app: &AppInstance, challenge: &AppChallenge) -> Result<Bytes> {
        if hash_bytes(&app.latest_state) == challenge.app_state_hash {
            return Ok(app.latest_state.clone());
        }
        let mut progressed: Vec<StateProgressedEvent> = self
            .store
            .get_state_progressed_events(&app.identity_hash)?
            .into_iter()
            .filter(|e| e.version_number > app.latest_version_number && e.version_number <= challenge.version_number)
            .collect();
        progressed.sort_by_key(|e| (e.version_number, e.position));
        progressed.dedup_by_key(|e| e.version_number);

        if !progressed.is_empty() {
            let logic = self.apps.get(&app.app_interface.addr)?;
            let mut state = app.latest_state.clone();
            for event in &progressed {
                state = logic.apply_action(&state, &event.action)?;
            }
            if hash_bytes(&state) == challenge.app_state_hash {
                debug!("replayed {} on-chain actions for {:?}", progressed.len(), app.identity_hash);
                return Ok(state);
            }
        }
        Err(EngineError::Validation(format!(
            "stored state of {:?} does not hash to the on-chain state",
            challenge.identity_hash
        )))
    }

    fn outcome_transaction(&self, challenge: &AppChallenge) -> Result<MinimalTransaction> {
        let (_, app) = self.app_of(&challenge.identity_hash)?;
        let state = self.onchain_state(&app, challenge)?;
        Ok(MinimalTransaction {
            to: self.network.challenge_registry,
            value: U256::zero(),
            data: abi::set_outcome(&app.identity(), &state),
        })
    }

    fn completion_transaction(&self, id: &H256) -> Result<MinimalTransaction> {
        let channel = self.channel_of(id)?;
        if channel.free_balance.identity_hash == *id {
            let setup = self
                .store
                .get_setup_commitment(&channel.multisig_address)?
                .ok_or_else(|| EngineError::not_found("setup commitment", channel.multisig_address))?;
            setup.assert_signatures()?;
            setup.transaction()
        } else {
            let conditional = self
                .store
                .get_conditional_transaction_commitment(id)?
                .ok_or_else(|| EngineError::not_found("conditional transaction", id))?;
            conditional.assert_signatures()?;
            conditional.transaction()
        }
    }

    async fn set_outcome(&self, challenge: &AppChallenge) -> Result<()> {
        let id = challenge.identity_hash;
        if self.is_answered(id, Response::SetOutcome, challenge.version_number) {
            return Ok(());
        }
        let result = match self.outcome_transaction(challenge) {
            Ok(tx) => self.submit(&tx).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(receipt) if receipt.success => {
                self.record_answer(id, Response::SetOutcome, challenge.version_number);
                info!("outcome set for {:?}", id);
                self.emit(WatcherEvent::ChallengeOutcomeSet { identity_hash: id, tx_hash: receipt.tx_hash })
            }
            Ok(receipt) => self.emit(WatcherEvent::ChallengeOutcomeFailed {
                identity_hash: id,
                error: format!("transaction {:?} reverted", receipt.tx_hash),
            }),
            Err(e) => {
                error!("failed to set outcome of {:?}: {}", id, e);
                self.emit(WatcherEvent::ChallengeOutcomeFailed { identity_hash: id, error: e.to_string() })
            }
        }
        Ok(())
    }

    /// Executes the stored conditional transaction, or the setup commitment for
    /// a free balance, once the registry holds the outcome.
    async fn complete(&self, challenge: &AppChallenge) -> Result<()> {
        let id = challenge.identity_hash;
        if self.is_answered(id, Response::Complete, challenge.version_number) {
            return Ok(());
        }
        let result = match self.completion_transaction(&id) {
            Ok(tx) => self.submit(&tx).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(receipt) if receipt.success => {
                self.record_answer(id, Response::Complete, challenge.version_number);
                let done = AppChallenge { status: ChallengeStatus::ConditionalSent, ..challenge.clone() };
                self.store.save_app_challenge(&done)?;
                info!("dispute on {:?} completed", id);
                self.emit(WatcherEvent::ChallengeCompleted { identity_hash: id, tx_hash: receipt.tx_hash });
            }
            Ok(receipt) => self.emit(WatcherEvent::ChallengeCompletionFailed {
                identity_hash: id,
                error: format!("transaction {:?} reverted", receipt.tx_hash),
            }),
            Err(e) => {
                error!("failed to complete dispute on {:?}: {}", id, e);
                self.emit(WatcherEvent::ChallengeCompletionFailed { identity_hash: id, error: e.to_string() })
            }
        }
        Ok(())
    }
}

/// `ConditionalSent` is never on chain, the registry keeps reporting the
/// outcome it was completed from.
fn is_still_completed(tracked: &AppChallenge, onchain: &AppChallenge) -> bool {
    tracked.status == ChallengeStatus::ConditionalSent
        && onchain.status == ChallengeStatus::OutcomeSet
        && onchain.version_number == tracked.version_number
}
