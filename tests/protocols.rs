mod common;

use async_trait::async_trait;
use common::{quick_config, transfer_app, Pair};
use ethers::types::{Address, U256};
use sc_engine::challenge::{AppChallenge, ChallengeStatus};
use sc_engine::commitments::EthereumCommitment;
use sc_engine::config::ProtocolConfig;
use sc_engine::middleware::{MiddlewareContext, MiddlewareRegistry, ValidationMiddleware};
use sc_engine::protocol::{ProtocolParams, UninstallParams};
use sc_engine::types::{ProtocolName, ETH_ASSET_ID};
use sc_engine::EngineError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn transfer_app_lifecycle() {
    let pair = Pair::new();
    let channel = pair.setup().await.unwrap();
    assert_eq!(channel.free_balance.latest_version_number, 0);
    for party in [&pair.a, &pair.b] {
        let setup = party.store.get_setup_commitment(&pair.multisig).unwrap().unwrap();
        assert!(setup.is_fully_signed());
    }
    pair.fund(100, 0).unwrap();

    let id = pair.propose(100).await.unwrap();
    assert!(pair.b.store.get_app_proposal(&id).unwrap().is_some());

    let installed = pair.install(id).await.unwrap();
    let balances = installed.free_balance_state().unwrap();
    assert_eq!(balances.balance_of(&ETH_ASSET_ID, &pair.a.address), U256::zero());
    assert_eq!(balances.active_apps, vec![id]);
    assert!(pair.a.store.get_conditional_transaction_commitment(&id).unwrap().unwrap().is_fully_signed());
    assert!(pair.b.store.get_conditional_transaction_commitment(&id).unwrap().unwrap().is_fully_signed());

    let acted = pair.take_action(id, 100).await.unwrap();
    assert_eq!(acted.get_app_instance(&id).unwrap().latest_version_number, 2);
    let b_app = pair.b.store.get_app_instance(&id).unwrap().unwrap();
    assert_eq!(b_app.latest_version_number, 2);
    let set_state = pair.b.store.get_set_state_commitment(&id).unwrap().unwrap();
    assert_eq!(set_state.version_number, 2);
    assert!(set_state.is_fully_signed());

    let challenge = AppChallenge {
        identity_hash: id,
        status: ChallengeStatus::InDispute,
        app_state_hash: b_app.state_hash(),
        version_number: 2,
        finalizes_at: 100,
    };
    pair.a.store.save_app_challenge(&challenge).unwrap();

    let uninstalled = pair.uninstall(id).await.unwrap();
    let balances = uninstalled.free_balance_state().unwrap();
    assert_eq!(balances.balance_of(&ETH_ASSET_ID, &pair.a.address), U256::zero());
    assert_eq!(balances.balance_of(&ETH_ASSET_ID, &pair.b.address), U256::from(100));
    assert!(balances.active_apps.is_empty());

    for party in [&pair.a, &pair.b] {
        let channel = party.store.get_state_channel(&pair.multisig).unwrap().unwrap();
        assert!(channel.app_instances.is_empty());
        assert_eq!(channel.free_balance, uninstalled.free_balance);
        assert!(party.store.get_set_state_commitment(&id).unwrap().is_none());
        assert!(party.store.get_conditional_transaction_commitment(&id).unwrap().is_none());
        assert!(party.store.get_state_channel_by_app_identity_hash(&id).unwrap().is_none());
    }
    assert_eq!(pair.a.store.get_app_challenge(&id).unwrap(), Some(challenge));
}

#[tokio::test]
async fn proposals_take_consecutive_sequence_numbers() {
    let pair = Pair::new();
    pair.setup().await.unwrap();
    pair.fund(300, 0).unwrap();

    let mut ids = HashSet::new();
    for _ in 0..3 {
        ids.insert(pair.propose(100).await.unwrap());
    }
    assert_eq!(ids.len(), 3);

    let channel = pair.b.store.get_state_channel(&pair.multisig).unwrap().unwrap();
    assert_eq!(channel.monotonic_num_proposed_apps, 3);
    let mut seqs: Vec<u64> = channel.proposed_app_instances.values().map(|p| p.app_seq_no).collect();
    seqs.sort();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn concurrent_runs_on_one_channel_are_serialized() {
    let pair = Pair::new();
    pair.setup().await.unwrap();
    pair.fund(200, 0).unwrap();

    let first = pair.a.runner.run_protocol(ProtocolParams::Propose(pair.propose_params(100)));
    let second = pair.a.runner.run_protocol(ProtocolParams::Propose(pair.propose_params(100)));
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    for party in [&pair.a, &pair.b] {
        let channel = party.store.get_state_channel(&pair.multisig).unwrap().unwrap();
        assert_eq!(channel.monotonic_num_proposed_apps, 2);
        assert_eq!(channel.proposed_app_instances.len(), 2);
    }
}

#[tokio::test]
async fn setup_twice_is_rejected() {
    let pair = Pair::new();
    pair.setup().await.unwrap();
    let err = pair.setup().await.unwrap_err();
    assert!(matches!(err, EngineError::Protocol { protocol: ProtocolName::Setup, seq: 1, .. }));
    assert!(matches!(err.root(), EngineError::Validation(_)));
}

#[tokio::test]
async fn invalid_action_changes_nothing() {
    let pair = Pair::new();
    pair.setup().await.unwrap();
    pair.fund(100, 0).unwrap();
    let id = pair.propose(100).await.unwrap();
    pair.install(id).await.unwrap();

    let err = pair.take_action(id, 101).await.unwrap_err();
    assert!(matches!(err.root(), EngineError::InvalidAction { .. }));
    for party in [&pair.a, &pair.b] {
        assert_eq!(party.store.get_app_instance(&id).unwrap().unwrap().latest_version_number, 1);
    }
}

#[tokio::test]
async fn uninstall_at_an_old_version_is_rejected() {
    let pair = Pair::new();
    pair.setup().await.unwrap();
    pair.fund(100, 0).unwrap();
    let id = pair.propose(100).await.unwrap();
    pair.install(id).await.unwrap();
    pair.take_action(id, 40).await.unwrap();

    let err = pair
        .a
        .runner
        .run_protocol(ProtocolParams::Uninstall(UninstallParams {
            multisig_address: pair.multisig,
            initiator_identifier: pair.a.address,
            responder_identifier: pair.b.address,
            app_identity_hash: id,
            action: None,
            version_number: Some(1),
        }))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), EngineError::Validation(_)));
    assert!(pair.a.store.get_app_instance(&id).unwrap().is_some());
    assert!(pair.b.store.get_app_instance(&id).unwrap().is_some());
}

#[tokio::test]
async fn uninstall_applies_a_final_action() {
    let pair = Pair::new();
    pair.setup().await.unwrap();
    pair.fund(100, 0).unwrap();
    let id = pair.propose(100).await.unwrap();
    pair.install(id).await.unwrap();

    let channel = pair
        .a
        .runner
        .run_protocol(ProtocolParams::Uninstall(UninstallParams {
            multisig_address: pair.multisig,
            initiator_identifier: pair.a.address,
            responder_identifier: pair.b.address,
            app_identity_hash: id,
            action: Some(sc_engine::apps::SimpleTransferApp::encode_action(U256::from(30))),
            version_number: None,
        }))
        .await
        .unwrap();
    let balances = channel.free_balance_state().unwrap();
    assert_eq!(balances.balance_of(&ETH_ASSET_ID, &pair.a.address), U256::from(70));
    assert_eq!(balances.balance_of(&ETH_ASSET_ID, &pair.b.address), U256::from(30));
}

#[tokio::test]
async fn proposals_may_only_pay_channel_owners() {
    let pair = Pair::new();
    pair.setup().await.unwrap();
    pair.fund(100, 0).unwrap();

    let mut params = pair.propose_params(100);
    params.initial_state =
        sc_engine::apps::SimpleTransferApp::initial_state(pair.a.address, Address::repeat_byte(0x77), U256::from(100));
    let err = pair.a.runner.run_protocol(ProtocolParams::Propose(params)).await.unwrap_err();
    assert!(matches!(err, EngineError::Protocol { protocol: ProtocolName::Propose, seq: 1, .. }));
    assert!(matches!(err.root(), EngineError::Validation(_)));

    let mut params = pair.propose_params(100);
    params.initial_state = vec![0xde, 0xad].into();
    assert!(pair.a.runner.run_protocol(ProtocolParams::Propose(params)).await.is_err());

    for party in [&pair.a, &pair.b] {
        let channel = party.store.get_state_channel(&pair.multisig).unwrap().unwrap();
        assert!(channel.proposed_app_instances.is_empty());
    }
}

#[tokio::test]
async fn unlisted_app_definitions_cannot_be_proposed() {
    let pair = Pair::new();
    pair.setup().await.unwrap();
    pair.fund(100, 0).unwrap();

    let mut params = pair.propose_params(100);
    params.app_definition = Address::repeat_byte(0xab);
    let err = pair.a.runner.run_protocol(ProtocolParams::Propose(params)).await.unwrap_err();
    assert!(matches!(err.root(), EngineError::UnknownAppDefinition(app) if *app == Address::repeat_byte(0xab)));
}

struct RejectAll;

#[async_trait]
impl ValidationMiddleware for RejectAll {
    async fn validate(&self, _context: &MiddlewareContext<'_>) -> Result<(), String> {
        Err("proposals are closed".into())
    }
}

struct Stall;

#[async_trait]
impl ValidationMiddleware for Stall {
    async fn validate(&self, _context: &MiddlewareContext<'_>) -> Result<(), String> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }
}

#[tokio::test]
async fn middleware_rejection_leaves_stores_untouched() {
    let mut middleware = MiddlewareRegistry::new();
    middleware.register(ProtocolName::Propose, Some(transfer_app()), Arc::new(RejectAll));
    let pair = Pair::with(quick_config(), middleware, MiddlewareRegistry::new());
    pair.setup().await.unwrap();
    pair.fund(100, 0).unwrap();

    let err = pair.propose(100).await.unwrap_err();
    assert!(matches!(err, EngineError::Protocol { protocol: ProtocolName::Propose, seq: 1, .. }));
    assert!(matches!(err.root(), EngineError::MiddlewareRejected(reason) if reason == "proposals are closed"));
    for party in [&pair.a, &pair.b] {
        let channel = party.store.get_state_channel(&pair.multisig).unwrap().unwrap();
        assert_eq!(channel.monotonic_num_proposed_apps, 0);
        assert!(channel.proposed_app_instances.is_empty());
    }
}

#[tokio::test]
async fn silent_counterparty_times_out() {
    let mut middleware = MiddlewareRegistry::new();
    middleware.register(ProtocolName::Propose, None, Arc::new(Stall));
    let config = ProtocolConfig { protocol_timeout_ms: 100, ..quick_config() };
    let pair = Pair::with(config, MiddlewareRegistry::new(), middleware);
    pair.setup().await.unwrap();
    pair.fund(100, 0).unwrap();

    let err = pair.propose(100).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(matches!(err.root(), EngineError::ProtocolTimeout { peer, .. } if *peer == pair.b.address));
    let channel = pair.a.store.get_state_channel(&pair.multisig).unwrap().unwrap();
    assert!(channel.proposed_app_instances.is_empty());
}
