use super::utils::{countersign, expect_reply, signature_at, tag};
use super::{ProtocolMessage, ProtocolParams, ProtocolRunner, SetupParams};
use crate::commitments::{SetStateCommitment, SetupCommitment};
use crate::error::{EngineError, Result};
use crate::state_channel::StateChannel;
use crate::types::ProtocolName;
use log::debug;
use uuid::Uuid;

const PROTOCOL: ProtocolName = ProtocolName::Setup;

struct Prepared {
    channel: StateChannel,
    setup: SetupCommitment,
    free_balance: SetStateCommitment,
}

/// Fresh channel plus the two commitments both parties sign for it.
fn prepare(runner: &ProtocolRunner, params: &SetupParams) -> Result<Prepared> {
    if runner.store.get_state_channel(&params.multisig_address)?.is_some() {
        return Err(EngineError::Validation(format!(
            "channel {:?} already exists",
            params.multisig_address
        )));
    }
    let network = &runner.network;
    let channel = StateChannel::setup(
        params.multisig_address,
        network.contract_addresses(),
        params.initiator_identifier,
        params.responder_identifier,
        network.identity_app,
        runner.free_balance_timeout(),
        &runner.config.assets,
        network.chain_id,
    )?;
    let setup = SetupCommitment::new(
        network,
        channel.multisig_address,
        channel.multisig_owners(),
        channel.free_balance.identity_hash,
    );
    let free_balance = SetStateCommitment::for_app(network.challenge_registry, &channel.free_balance);
    Ok(Prepared { channel, setup, free_balance })
}

fn open(runner: &ProtocolRunner, process_id: Uuid, params: &SetupParams) -> Result<(Prepared, ProtocolMessage)> {
    let prepared = prepare(runner, params)?;
    let signatures = vec![runner.sign(&prepared.setup)?, runner.sign(&prepared.free_balance)?];
    let opening = ProtocolMessage::new(
        process_id,
        1,
        params.initiator_identifier,
        params.responder_identifier,
        ProtocolParams::Setup(params.clone()),
    )
    .with_signatures(signatures);
    Ok((prepared, opening))
}

fn finish(
    runner: &ProtocolRunner,
    mut prepared: Prepared,
    mine: &ProtocolMessage,
    theirs: &ProtocolMessage,
) -> Result<StateChannel> {
    let counterparty = theirs.from;
    countersign(&mut prepared.setup, signature_at(mine, 0)?, signature_at(theirs, 0)?, counterparty)?;
    countersign(&mut prepared.free_balance, signature_at(mine, 1)?, signature_at(theirs, 1)?, counterparty)?;
    runner
        .store
        .create_state_channel(&prepared.channel, &prepared.setup, &prepared.free_balance)?;
    debug!("setup {} persisted channel {:?}", mine.process_id, prepared.channel.multisig_address);
    Ok(prepared.channel)
}

pub(super) async fn initiate(runner: &ProtocolRunner, process_id: Uuid, params: &SetupParams) -> Result<StateChannel> {
    let (prepared, opening) = open(runner, process_id, params).map_err(tag(PROTOCOL, 1))?;
    let reply = runner.request(opening.clone()).await.map_err(tag(PROTOCOL, 1))?;
    expect_reply(&opening, &reply)
        .and_then(|_| finish(runner, prepared, &opening, &reply))
        .map_err(tag(PROTOCOL, 2))
}

pub(super) async fn respond(
    runner: &ProtocolRunner,
    message: &ProtocolMessage,
    params: &SetupParams,
) -> Result<StateChannel> {
    let prepared = prepare(runner, params).map_err(tag(PROTOCOL, 1))?;
    let signatures = [runner.sign(&prepared.setup), runner.sign(&prepared.free_balance)]
        .into_iter()
        .collect::<Result<Vec<_>>>()
        .map_err(tag(PROTOCOL, 1))?;
    let reply = message.reply(signatures);
    let channel = finish(runner, prepared, &reply, message).map_err(tag(PROTOCOL, 1))?;
    runner.messaging.send(reply).await.map_err(tag(PROTOCOL, 2))?;
    Ok(channel)
}
