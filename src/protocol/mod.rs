//! Two-party protocol runs.
//!
//! Every protocol is a fixed sequence of numbered messages shared by both
//! roles. A run recomputes the next channel from what it has persisted plus the
//! message params, signs the resulting commitments, checks the counterparty's
//! signatures and writes everything in one store call on its final step.
//! Failures carry the protocol and step they happened at.

mod install;
mod message;
mod propose;
mod setup;
mod take_action;
mod uninstall;
mod utils;

pub use message::{
    InstallParams, ProposeParams, ProtocolMessage, ProtocolParams, SetupParams, TakeActionParams, UninstallParams,
};

use crate::apps::AppRegistry;
use crate::config::ProtocolConfig;
use crate::error::{EngineError, Result};
use crate::lock::LockService;
use crate::messaging::Messaging;
use crate::middleware::MiddlewareRegistry;
use crate::signer::ChannelSigner;
use crate::state_channel::StateChannel;
use crate::store::Store;
use crate::types::{ContractRegistry, NetworkContext};
use ethers::types::Address;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct ProtocolRunner {
    signer: ChannelSigner,
    store: Arc<Store>,
    locks: LockService,
    messaging: Arc<dyn Messaging>,
    network: NetworkContext,
    contracts: ContractRegistry,
    apps: Arc<AppRegistry>,
    middleware: Arc<MiddlewareRegistry>,
    config: ProtocolConfig,
}

impl ProtocolRunner {
    pub fn new(
        signer: ChannelSigner,
        store: Arc<Store>,
        messaging: Arc<dyn Messaging>,
        network: NetworkContext,
        apps: Arc<AppRegistry>,
        config: ProtocolConfig,
    ) -> Result<Self> {
        let contracts = ContractRegistry::new(&network)?;
        Ok(Self {
            signer,
            store,
            locks: LockService::new(),
            messaging,
            network,
            contracts,
            apps,
            middleware: Arc::new(MiddlewareRegistry::new()),
            config,
        })
    }

    pub fn with_middleware(mut self, middleware: Arc<MiddlewareRegistry>) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn with_lock_service(mut self, locks: LockService) -> Self {
        self.locks = locks;
        self
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Runs a protocol as its initiator and returns the channel as persisted.
    pub async fn run_protocol(&self, params: ProtocolParams) -> Result<StateChannel> {
        let protocol = params.protocol();
        if params.initiator() != self.address() {
            return Err(EngineError::Validation(format!(
                "{:?} cannot initiate on behalf of {:?}",
                self.address(),
                params.initiator()
            ))
            .at_step(protocol, 0));
        }
        let process_id = Uuid::new_v4();
        let multisig = params.multisig_address();
        info!("{} {} started for {:?}", protocol, process_id, multisig);

        let work = async {
            match &params {
                ProtocolParams::Setup(p) => setup::initiate(self, process_id, p).await,
                ProtocolParams::Propose(p) => propose::initiate(self, process_id, p).await,
                ProtocolParams::Install(p) => install::initiate(self, process_id, p).await,
                ProtocolParams::Uninstall(p) => uninstall::initiate(self, process_id, p).await,
                ProtocolParams::TakeAction(p) => take_action::initiate(self, process_id, p).await,
            }
        };
        let channel = self
            .locks
            .acquire_lock(&lock_name(&multisig), self.config.lock_timeout(), work)
            .await
            .map_err(|e| e.at_step(protocol, 0))?;
        info!("{} {} completed for {:?}", protocol, process_id, multisig);
        Ok(channel)
    }

    /// Answers the first message of a run started by the counterparty.
    pub async fn run_responder(&self, message: ProtocolMessage) -> Result<StateChannel> {
        let protocol = message.protocol;
        self.check_opening_message(&message).map_err(|e| e.at_step(protocol, message.seq))?;
        let multisig = message.params.multisig_address();
        let process_id = message.process_id;
        debug!("{} {} responding for {:?}", protocol, process_id, multisig);

        let work = async {
            match &message.params {
                ProtocolParams::Setup(p) => setup::respond(self, &message, p).await,
                ProtocolParams::Propose(p) => propose::respond(self, &message, p).await,
                ProtocolParams::Install(p) => install::respond(self, &message, p).await,
                ProtocolParams::Uninstall(p) => uninstall::respond(self, &message, p).await,
                ProtocolParams::TakeAction(p) => take_action::respond(self, &message, p).await,
            }
        };
        let channel = self
            .locks
            .acquire_lock(&lock_name(&multisig), self.config.lock_timeout(), work)
            .await
            .map_err(|e| e.at_step(protocol, 0))?;
        info!("{} {} completed as responder for {:?}", protocol, process_id, multisig);
        Ok(channel)
    }

    /// Spawns a responder run for every run-opening message until `inbound`
    /// closes.
    pub async fn serve(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<ProtocolMessage>) {
        while let Some(message) = inbound.recv().await {
            if message.seq != 1 {
                warn!(
                    "ignoring {} seq {} for unknown run {}",
                    message.protocol, message.seq, message.process_id
                );
                continue;
            }
            let runner = self.clone();
            tokio::spawn(async move {
                let process_id = message.process_id;
                if let Err(e) = runner.run_responder(message).await {
                    error!("responder run {} failed: {}", process_id, e);
                }
            });
        }
        debug!("{:?} stopped serving", self.address());
    }

    fn check_opening_message(&self, message: &ProtocolMessage) -> Result<()> {
        if message.seq != 1 {
            return Err(EngineError::Validation(format!("runs open with seq 1, got {}", message.seq)));
        }
        if message.protocol != message.params.protocol() {
            return Err(EngineError::Validation("message protocol does not match its params".into()));
        }
        if message.to != self.address() || message.params.responder() != self.address() {
            return Err(EngineError::Validation(format!("message is not addressed to {:?}", self.address())));
        }
        if message.from != message.params.initiator() {
            return Err(EngineError::Validation(format!(
                "message from {:?} claims initiator {:?}",
                message.from,
                message.params.initiator()
            )));
        }
        Ok(())
    }
}

fn lock_name(multisig: &Address) -> String {
    format!("{:?}", multisig)
}
