use super::utils::{countersign, expect_reply, signature_at, tag};
use super::{ProposeParams, ProtocolMessage, ProtocolParams, ProtocolRunner};
use crate::app_instance::{AppInterface, AppProposal};
use crate::commitments::SetStateCommitment;
use crate::error::{EngineError, Result};
use crate::middleware::MiddlewareContext;
use crate::outcome::InterpreterParams;
use crate::state_channel::StateChannel;
use crate::types::ProtocolName;
use ethers::types::H256;
use log::debug;
use uuid::Uuid;

const PROTOCOL: ProtocolName = ProtocolName::Propose;

struct Prepared {
    channel: StateChannel,
    proposal: AppProposal,
    set_state: SetStateCommitment,
}

async fn prepare(
    runner: &ProtocolRunner,
    wrapped: &ProtocolParams,
    params: &ProposeParams,
    is_initiator: bool,
) -> Result<Prepared> {
    let channel = runner.load_channel(&params.multisig_address)?;
    for party in [params.initiator_identifier, params.responder_identifier] {
        if !channel.is_owner(&party) {
            return Err(EngineError::Validation(format!(
                "{:?} is not an owner of channel {:?}",
                party, channel.multisig_address
            )));
        }
    }
    if !runner.contracts.is_registered_app(&params.app_definition) {
        return Err(EngineError::UnknownAppDefinition(params.app_definition));
    }
    let logic = runner.apps.get(&params.app_definition)?;

    let balances = channel.free_balance_state()?;
    let deposits = [
        (params.initiator_identifier, params.initiator_deposit_asset_id, params.initiator_deposit),
        (params.responder_identifier, params.responder_deposit_asset_id, params.responder_deposit),
    ];
    for (owner, asset, amount) in deposits {
        let available = balances.balance_of(&asset, &owner);
        if available < amount {
            return Err(EngineError::Validation(format!(
                "{:?} cannot cover a deposit of {} in {:?}, free balance is {}",
                owner, amount, asset, available
            )));
        }
    }

    let interpreter_params = InterpreterParams::for_deposits(
        params.outcome_type,
        params.initiator_identifier,
        params.responder_identifier,
        (params.initiator_deposit_asset_id, params.initiator_deposit),
        (params.responder_deposit_asset_id, params.responder_deposit),
    )?;
    let initial_outcome = logic.compute_outcome(&params.initial_state)?;
    channel.check_credits(&interpreter_params.credits(&initial_outcome)?)?;
    let mut proposal = AppProposal {
        identity_hash: H256::zero(),
        multisig_address: channel.multisig_address,
        initiator_identifier: params.initiator_identifier,
        responder_identifier: params.responder_identifier,
        app_interface: AppInterface {
            addr: params.app_definition,
            state_encoding: params.state_encoding.clone(),
            action_encoding: params.action_encoding.clone(),
        },
        default_timeout: params.default_timeout,
        state_timeout: params.state_timeout,
        initial_state: params.initial_state.clone(),
        app_seq_no: channel.next_app_seq_no(),
        interpreter_params,
        initiator_deposit: params.initiator_deposit,
        initiator_deposit_asset_id: params.initiator_deposit_asset_id,
        responder_deposit: params.responder_deposit,
        responder_deposit_asset_id: params.responder_deposit_asset_id,
        meta: params.meta.clone(),
    };
    proposal.identity_hash = proposal.identity().identity_hash();

    let context = MiddlewareContext {
        protocol: PROTOCOL,
        is_initiator,
        params: wrapped,
        channel: &channel,
        proposal: Some(&proposal),
        app: None,
    };
    runner.middleware.validate(Some(params.app_definition), &context).await?;

    let next = channel.add_proposal(proposal.clone())?;
    let set_state = SetStateCommitment::for_app(runner.network.challenge_registry, &proposal.to_app_instance());
    Ok(Prepared { channel: next, proposal, set_state })
}

fn finish(
    runner: &ProtocolRunner,
    mut prepared: Prepared,
    mine: &ProtocolMessage,
    theirs: &ProtocolMessage,
) -> Result<StateChannel> {
    countersign(&mut prepared.set_state, signature_at(mine, 0)?, signature_at(theirs, 0)?, theirs.from)?;
    runner
        .store
        .create_app_proposal(&prepared.channel, &prepared.proposal, &prepared.set_state)?;
    debug!(
        "propose {} persisted {} proposal {:?} seq {}",
        mine.process_id,
        runner.contracts.name_of(&prepared.proposal.app_interface.addr).unwrap_or("unnamed"),
        prepared.proposal.identity_hash,
        prepared.proposal.app_seq_no
    );
    Ok(prepared.channel)
}

pub(super) async fn initiate(runner: &ProtocolRunner, process_id: Uuid, params: &ProposeParams) -> Result<StateChannel> {
    let wrapped = ProtocolParams::Propose(params.clone());
    let prepared = prepare(runner, &wrapped, params, true).await.map_err(tag(PROTOCOL, 1))?;
    let signature = runner.sign(&prepared.set_state).map_err(tag(PROTOCOL, 1))?;
    let opening = ProtocolMessage::new(process_id, 1, params.initiator_identifier, params.responder_identifier, wrapped)
        .with_signatures(vec![signature]);

    let reply = runner.request(opening.clone()).await.map_err(tag(PROTOCOL, 1))?;
    expect_reply(&opening, &reply)
        .and_then(|_| finish(runner, prepared, &opening, &reply))
        .map_err(tag(PROTOCOL, 2))
}

pub(super) async fn respond(
    runner: &ProtocolRunner,
    message: &ProtocolMessage,
    params: &ProposeParams,
) -> Result<StateChannel> {
    let prepared = prepare(runner, &message.params, params, false).await.map_err(tag(PROTOCOL, 1))?;
    let signature = runner.sign(&prepared.set_state).map_err(tag(PROTOCOL, 1))?;
    let reply = message.reply(vec![signature]);
    let channel = finish(runner, prepared, &reply, message).map_err(tag(PROTOCOL, 1))?;
    runner.messaging.send(reply).await.map_err(tag(PROTOCOL, 2))?;
    Ok(channel)
}
