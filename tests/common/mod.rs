#![allow(dead_code)]

use ethers::types::{Address, H256, U256};
use sc_engine::apps::{AppRegistry, SimpleTransferApp, SIMPLE_TRANSFER_ACTION_ENCODING, SIMPLE_TRANSFER_STATE_ENCODING};
use sc_engine::config::ProtocolConfig;
use sc_engine::messaging::MessagingHub;
use sc_engine::middleware::MiddlewareRegistry;
use sc_engine::outcome::OutcomeType;
use sc_engine::protocol::{
    InstallParams, ProposeParams, ProtocolParams, SetupParams, TakeActionParams, UninstallParams,
};
use sc_engine::types::{NetworkContext, ETH_ASSET_ID};
use sc_engine::{ChannelSigner, ProtocolRunner, Result, StateChannel, Store};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub fn transfer_app() -> Address {
    Address::repeat_byte(0xaa)
}

pub fn network() -> NetworkContext {
    NetworkContext {
        chain_id: 1337,
        challenge_registry: Address::repeat_byte(0xee),
        conditional_transaction_delegate_target: Address::repeat_byte(0xc0),
        identity_app: Address::repeat_byte(0x1d),
        multi_asset_multi_party_coin_transfer_interpreter: Address::repeat_byte(0x31),
        single_asset_two_party_coin_transfer_interpreter: Address::repeat_byte(0x32),
        two_party_fixed_outcome_interpreter: Address::repeat_byte(0x33),
        proxy_factory: Address::repeat_byte(0xf0),
        multisig_mastercopy: Address::repeat_byte(0xf1),
        apps: BTreeMap::from([("SimpleTransferApp".to_string(), transfer_app())]),
    }
}

pub fn quick_config() -> ProtocolConfig {
    ProtocolConfig { lock_timeout_ms: 2_000, protocol_timeout_ms: 2_000, ..Default::default() }
}

pub struct Party {
    pub address: Address,
    pub runner: Arc<ProtocolRunner>,
    pub store: Arc<Store>,
}

/// Two runners talking over one in-memory hub, each with its own store.
pub struct Pair {
    pub hub: MessagingHub,
    pub a: Party,
    pub b: Party,
    pub multisig: Address,
}

impl Pair {
    pub fn new() -> Self {
        Self::with(quick_config(), MiddlewareRegistry::new(), MiddlewareRegistry::new())
    }

    pub fn with(config: ProtocolConfig, a_middleware: MiddlewareRegistry, b_middleware: MiddlewareRegistry) -> Self {
        let hub = MessagingHub::new();
        let a = party(&hub, config.clone(), a_middleware);
        let b = party(&hub, config, b_middleware);
        Self { hub, a, b, multisig: Address::repeat_byte(0x5c) }
    }

    pub async fn setup(&self) -> Result<StateChannel> {
        self.a
            .runner
            .run_protocol(ProtocolParams::Setup(SetupParams {
                multisig_address: self.multisig,
                initiator_identifier: self.a.address,
                responder_identifier: self.b.address,
            }))
            .await
    }

    /// Credits the same deposits in both stores.
    pub fn fund(&self, a_amount: u64, b_amount: u64) -> Result<()> {
        for party in [&self.a, &self.b] {
            let channel = party.store.get_state_channel(&self.multisig)?.expect("channel exists");
            let channel = channel
                .record_deposit(ETH_ASSET_ID, self.a.address, U256::from(a_amount))?
                .record_deposit(ETH_ASSET_ID, self.b.address, U256::from(b_amount))?;
            party.store.save_state_channel(&channel)?;
        }
        Ok(())
    }

    pub fn propose_params(&self, amount: u64) -> ProposeParams {
        ProposeParams {
            multisig_address: self.multisig,
            initiator_identifier: self.a.address,
            responder_identifier: self.b.address,
            app_definition: transfer_app(),
            state_encoding: SIMPLE_TRANSFER_STATE_ENCODING.to_string(),
            action_encoding: Some(SIMPLE_TRANSFER_ACTION_ENCODING.to_string()),
            initiator_deposit: U256::from(amount),
            initiator_deposit_asset_id: ETH_ASSET_ID,
            responder_deposit: U256::zero(),
            responder_deposit_asset_id: ETH_ASSET_ID,
            default_timeout: U256::from(10),
            state_timeout: U256::from(10),
            initial_state: SimpleTransferApp::initial_state(self.a.address, self.b.address, U256::from(amount)),
            outcome_type: OutcomeType::SingleAssetTwoPartyCoinTransfer,
            meta: None,
        }
    }

    /// Proposes a transfer app funded by `a` and returns its identity hash.
    pub async fn propose(&self, amount: u64) -> Result<H256> {
        let channel = self.a.runner.run_protocol(ProtocolParams::Propose(self.propose_params(amount))).await?;
        let proposal = channel
            .proposed_app_instances
            .values()
            .find(|p| p.app_seq_no == channel.monotonic_num_proposed_apps)
            .expect("new proposal");
        Ok(proposal.identity_hash)
    }

    pub async fn install(&self, identity_hash: H256) -> Result<StateChannel> {
        let channel = self
            .a
            .runner
            .run_protocol(ProtocolParams::Install(InstallParams {
                multisig_address: self.multisig,
                initiator_identifier: self.a.address,
                responder_identifier: self.b.address,
                proposal_identity_hash: identity_hash,
            }))
            .await?;
        // the responder persists on the last message, after the initiator returns
        let b_store = self.b.store.clone();
        wait_until(|| {
            b_store
                .get_state_channel(&self.multisig)
                .ok()
                .flatten()
                .map_or(false, |c| c.app_instances.contains_key(&identity_hash))
        })
        .await;
        Ok(channel)
    }

    pub async fn take_action(&self, identity_hash: H256, amount: u64) -> Result<StateChannel> {
        self.a
            .runner
            .run_protocol(ProtocolParams::TakeAction(TakeActionParams {
                multisig_address: self.multisig,
                initiator_identifier: self.a.address,
                responder_identifier: self.b.address,
                app_identity_hash: identity_hash,
                action: SimpleTransferApp::encode_action(U256::from(amount)),
                state_timeout: None,
            }))
            .await
    }

    pub async fn uninstall(&self, identity_hash: H256) -> Result<StateChannel> {
        self.a
            .runner
            .run_protocol(ProtocolParams::Uninstall(UninstallParams {
                multisig_address: self.multisig,
                initiator_identifier: self.a.address,
                responder_identifier: self.b.address,
                app_identity_hash: identity_hash,
                action: None,
                version_number: None,
            }))
            .await
    }
}

fn party(hub: &MessagingHub, config: ProtocolConfig, middleware: MiddlewareRegistry) -> Party {
    let signer = ChannelSigner::random();
    let address = signer.address();
    let store = Arc::new(Store::in_memory().expect("memory store"));
    let (endpoint, inbound) = hub.connect(address).expect("connect");
    let apps = AppRegistry::new().with(transfer_app(), Arc::new(SimpleTransferApp));
    let runner = ProtocolRunner::new(signer, store.clone(), endpoint, network(), Arc::new(apps), config)
        .expect("runner")
        .with_middleware(Arc::new(middleware));
    let runner = Arc::new(runner);
    tokio::spawn(runner.clone().serve(inbound));
    Party { address, runner, store }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}
