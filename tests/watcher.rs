mod common;

use common::{network, Pair};
use ethers::types::{Bytes, H256, U256};
use sc_engine::apps::{AppLogic, AppRegistry, SimpleTransferApp};
use sc_engine::chain::abi::{self, OnchainChallenge, StateProgressedLog};
use sc_engine::chain::MockChain;
use sc_engine::challenge::ChallengeStatus;
use sc_engine::config::WatcherConfig;
use sc_engine::types::hash_bytes;
use sc_engine::watcher::{WatcherEvent, WatcherEventKind};
use sc_engine::Watcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn next_event(events: &mut broadcast::Receiver<WatcherEvent>, kind: WatcherEventKind) -> WatcherEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("watcher event stream");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .expect("watcher event in time")
}

fn selectors(chain: &MockChain) -> Vec<[u8; 4]> {
    chain.submitted().unwrap().iter().filter_map(|tx| abi::selector_of(&tx.data)).collect()
}

/// Polls fast and never reads the head block, so a log emitted into the head
/// is always picked up once the next block is mined.
fn watcher_config() -> WatcherConfig {
    WatcherConfig { poll_interval_ms: 10, start_block: Some(0), confirmations: 1, ..Default::default() }
}

fn watcher_for(chain: &Arc<MockChain>, pair: &Pair) -> Watcher {
    let apps = Arc::new(AppRegistry::for_network(&network()));
    Watcher::new(chain.clone(), pair.a.store.clone(), network(), apps, watcher_config())
}

async fn installed_pair() -> (Pair, H256) {
    let pair = Pair::new();
    pair.setup().await.unwrap();
    pair.fund(100, 0).unwrap();
    let id = pair.propose(100).await.unwrap();
    pair.install(id).await.unwrap();
    (pair, id)
}

#[tokio::test]
async fn stale_dispute_is_progressed_finalized_and_paid_out() {
    let (pair, id) = installed_pair().await;
    pair.take_action(id, 100).await.unwrap();
    let app = pair.a.store.get_app_instance(&id).unwrap().unwrap();
    assert_eq!(app.latest_version_number, 2);

    let chain = Arc::new(MockChain::new(network().challenge_registry));
    let watcher = watcher_for(&chain, &pair);
    let mut events = watcher.subscribe();
    watcher.start().await.unwrap();

    // the counterparty disputes with the state it held before the transfer
    let head = chain.mine_block().unwrap();
    let stale = OnchainChallenge {
        status: 1,
        app_state_hash: H256::repeat_byte(1),
        version_number: 1,
        finalizes_at: head + 50,
    };
    chain.emit_challenge_updated(id, stale).unwrap();
    chain.mine_block().unwrap();

    match next_event(&mut events, WatcherEventKind::ChallengeProgressed).await {
        WatcherEvent::ChallengeProgressed { identity_hash, version_number, .. } => {
            assert_eq!(identity_hash, id);
            assert_eq!(version_number, 2);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(selectors(&chain), vec![ethers::utils::id(abi::SET_STATE)]);

    let head = chain.head().unwrap();
    let progressed = OnchainChallenge {
        status: 1,
        app_state_hash: app.state_hash(),
        version_number: 2,
        finalizes_at: head + 2,
    };
    chain.emit_challenge_updated(id, progressed).unwrap();
    chain.mine_blocks(4).unwrap();
    next_event(&mut events, WatcherEventKind::ChallengeOutcomeSet).await;

    chain.emit_challenge_updated(id, OnchainChallenge { status: 4, ..progressed }).unwrap();
    chain.mine_block().unwrap();
    next_event(&mut events, WatcherEventKind::ChallengeCompleted).await;
    watcher.stop().await;

    assert_eq!(
        selectors(&chain),
        vec![
            ethers::utils::id(abi::SET_STATE),
            ethers::utils::id(abi::SET_OUTCOME),
            ethers::utils::id(abi::EXEC_TRANSACTION),
        ]
    );
    let challenge = pair.a.store.get_app_challenge(&id).unwrap().unwrap();
    assert_eq!(challenge.status, ChallengeStatus::ConditionalSent);
    assert_eq!(challenge.version_number, 2);
    assert_eq!(pair.a.store.get_challenge_updated_events(&id).unwrap().len(), 3);
}

#[tokio::test]
async fn initiate_submits_app_and_free_balance_states() {
    let (pair, id) = installed_pair().await;
    let chain = Arc::new(MockChain::new(network().challenge_registry));
    let watcher = watcher_for(&chain, &pair);

    let hashes = watcher.initiate(id).await.unwrap();
    assert_eq!(hashes.len(), 2);
    let submitted = chain.submitted().unwrap();
    assert!(submitted.iter().all(|tx| tx.to == network().challenge_registry));
    assert_eq!(selectors(&chain), vec![ethers::utils::id(abi::SET_STATE); 2]);

    assert!(watcher.initiate(H256::repeat_byte(0x99)).await.is_err());
}

#[tokio::test]
async fn reorged_out_challenge_is_reset() {
    let (pair, id) = installed_pair().await;
    let chain = Arc::new(MockChain::new(network().challenge_registry));
    let watcher = watcher_for(&chain, &pair);
    let mut events = watcher.subscribe();
    watcher.start().await.unwrap();

    chain.mine_block().unwrap();
    let challenge = OnchainChallenge {
        status: 1,
        app_state_hash: H256::repeat_byte(1),
        version_number: 1,
        finalizes_at: 1_000,
    };
    chain.emit_challenge_updated(id, challenge).unwrap();
    chain.mine_block().unwrap();
    next_event(&mut events, WatcherEventKind::ChallengeUpdated).await;
    assert_eq!(pair.a.store.get_app_challenge(&id).unwrap().unwrap().status, ChallengeStatus::InDispute);

    chain
        .set_app_challenge(id, OnchainChallenge { status: 0, app_state_hash: H256::zero(), version_number: 0, finalizes_at: 0 })
        .unwrap();
    chain.reorg(2).unwrap();
    match next_event(&mut events, WatcherEventKind::ChallengeUpdated).await {
        WatcherEvent::ChallengeUpdated { challenge } => assert_eq!(challenge.status, ChallengeStatus::NoChallenge),
        other => panic!("unexpected {:?}", other),
    }
    watcher.stop().await;
    assert!(chain.submitted().unwrap().is_empty());
    assert_eq!(pair.a.store.get_app_challenge(&id).unwrap().unwrap().version_number, 0);
}

#[tokio::test]
async fn outcome_follows_actions_progressed_on_chain() {
    let (pair, id) = installed_pair().await;
    let app = pair.a.store.get_app_instance(&id).unwrap().unwrap();
    assert_eq!(app.latest_version_number, 1);

    let chain = Arc::new(MockChain::new(network().challenge_registry));
    let watcher = watcher_for(&chain, &pair);
    let mut events = watcher.subscribe();
    watcher.start().await.unwrap();

    // the counterparty disputes our latest state, then moves it forward on chain
    let head = chain.mine_block().unwrap();
    let disputed = OnchainChallenge {
        status: 1,
        app_state_hash: app.state_hash(),
        version_number: 1,
        finalizes_at: head + 50,
    };
    chain.emit_challenge_updated(id, disputed).unwrap();
    let action = SimpleTransferApp::encode_action(U256::from(30));
    let progressed = SimpleTransferApp.apply_action(&app.latest_state, &action).unwrap();
    chain
        .emit_state_progressed(&StateProgressedLog {
            identity_hash: id,
            action,
            version_number: 2,
            timeout: U256::from(10),
            turn_taker: pair.b.address,
            signature: Bytes::default(),
        })
        .unwrap();
    let in_progression = OnchainChallenge {
        status: 2,
        app_state_hash: hash_bytes(&progressed),
        version_number: 2,
        finalizes_at: head + 3,
    };
    chain.emit_challenge_updated(id, in_progression).unwrap();
    chain.mine_blocks(5).unwrap();

    next_event(&mut events, WatcherEventKind::ChallengeOutcomeSet).await;
    watcher.stop().await;
    let submitted = chain.submitted().unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].data, abi::set_outcome(&app.identity(), &progressed));
    assert_eq!(pair.a.store.get_state_progressed_events(&id).unwrap().len(), 1);
}
