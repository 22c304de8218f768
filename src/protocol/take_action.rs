use super::utils::{countersign, expect_reply, signature_at, tag};
use super::{ProtocolMessage, ProtocolParams, ProtocolRunner, TakeActionParams};
use crate::app_instance::AppInstance;
use crate::commitments::SetStateCommitment;
use crate::error::{EngineError, Result};
use crate::middleware::MiddlewareContext;
use crate::state_channel::StateChannel;
use crate::types::ProtocolName;
use log::debug;
use uuid::Uuid;

const PROTOCOL: ProtocolName = ProtocolName::TakeAction;

struct Prepared {
    channel: StateChannel,
    app: AppInstance,
    set_state: SetStateCommitment,
}

async fn prepare(
    runner: &ProtocolRunner,
    wrapped: &ProtocolParams,
    params: &TakeActionParams,
    is_initiator: bool,
) -> Result<Prepared> {
    let channel = runner.load_channel(&params.multisig_address)?;
    let app = channel.get_app_instance(&params.app_identity_hash)?;
    if !app.is_participant(&params.initiator_identifier) {
        return Err(EngineError::Validation(format!(
            "{:?} is not a participant of app {:?}",
            params.initiator_identifier, app.identity_hash
        )));
    }
    let logic = runner.apps.get(&app.app_interface.addr)?;
    if let Some(turn_taker) = logic.turn_taker(&app.latest_state, &app.participants()) {
        if turn_taker != params.initiator_identifier {
            return Err(EngineError::InvalidAction {
                identity_hash: app.identity_hash,
                reason: format!("it is {:?}'s turn", turn_taker),
            });
        }
    }

    let state = logic
        .apply_action(&app.latest_state, &params.action)
        .map_err(|e| EngineError::InvalidAction { identity_hash: app.identity_hash, reason: e.to_string() })?;
    let next_app = app.set_state(state, params.state_timeout.unwrap_or(app.default_timeout));

    let context = MiddlewareContext {
        protocol: PROTOCOL,
        is_initiator,
        params: wrapped,
        channel: &channel,
        proposal: None,
        app: Some(&next_app),
    };
    runner.middleware.validate(Some(next_app.app_interface.addr), &context).await?;

    let next = channel.set_app_instance(next_app.clone())?;
    let set_state = SetStateCommitment::for_app(runner.network.challenge_registry, &next_app);
    Ok(Prepared { channel: next, app: next_app, set_state })
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
        .update_app_instance(&prepared.channel, &prepared.app, &prepared.set_state)?;
    debug!(
        "take_action {} moved app {:?} to version {}",
        mine.process_id, prepared.app.identity_hash, prepared.app.latest_version_number
    );
    Ok(prepared.channel)
}

pub(super) async fn initiate(
    runner: &ProtocolRunner,
    process_id: Uuid,
    params: &TakeActionParams,
) -> Result<StateChannel> {
    let wrapped = ProtocolParams::TakeAction(params.clone());
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
    params: &TakeActionParams,
) -> Result<StateChannel> {
    let prepared = prepare(runner, &message.params, params, false).await.map_err(tag(PROTOCOL, 1))?;
    let signature = runner.sign(&prepared.set_state).map_err(tag(PROTOCOL, 1))?;
    let reply = message.reply(vec![signature]);
    let channel = finish(runner, prepared, &reply, message).map_err(tag(PROTOCOL, 1))?;
    runner.messaging.send(reply).await.map_err(tag(PROTOCOL, 2))?;
    Ok(channel)
}
