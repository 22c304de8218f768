use super::utils::{countersign, expect_reply, signature_at, tag};
use super::{ProtocolMessage, ProtocolParams, ProtocolRunner, UninstallParams};
use crate::commitments::SetStateCommitment;
use crate::error::{EngineError, Result};
use crate::middleware::MiddlewareContext;
use crate::state_channel::StateChannel;
use crate::types::ProtocolName;
use ethers::types::H256;
use log::debug;
use uuid::Uuid;

const PROTOCOL: ProtocolName = ProtocolName::Uninstall;

struct Prepared {
    channel: StateChannel,
    identity_hash: H256,
    free_balance: SetStateCommitment,
}

async fn prepare(
    runner: &ProtocolRunner,
    wrapped: &ProtocolParams,
    params: &UninstallParams,
    is_initiator: bool,
) -> Result<Prepared> {
    let channel = runner.load_channel(&params.multisig_address)?;
    let app = channel.get_app_instance(&params.app_identity_hash)?;
    match params.version_number {
        Some(version) if version == app.latest_version_number => {}
        Some(version) => {
            return Err(EngineError::Validation(format!(
                "uninstall of {:?} at version {}, local version is {}",
                app.identity_hash, version, app.latest_version_number
            )))
        }
        None => return Err(EngineError::Validation("uninstall carries no version number".into())),
    }

    let logic = runner.apps.get(&app.app_interface.addr)?;
    let final_app = match &params.action {
        Some(action) => {
            let state = logic
                .apply_action(&app.latest_state, action)
                .map_err(|e| EngineError::InvalidAction { identity_hash: app.identity_hash, reason: e.to_string() })?;
            app.set_state(state, app.default_timeout)
        }
        None => app.clone(),
    };

    let context = MiddlewareContext {
        protocol: PROTOCOL,
        is_initiator,
        params: wrapped,
        channel: &channel,
        proposal: None,
        app: Some(&final_app),
    };
    runner.middleware.validate(Some(final_app.app_interface.addr), &context).await?;

    let outcome = logic.compute_outcome(&final_app.latest_state)?;
    let credits = final_app.interpreter_params.credits(&outcome)?;
    let next = channel.uninstall_app(&final_app.identity_hash, &credits, runner.free_balance_timeout())?;
    let free_balance = SetStateCommitment::for_app(runner.network.challenge_registry, &next.free_balance);
    Ok(Prepared { channel: next, identity_hash: final_app.identity_hash, free_balance })
}

fn finish(
    runner: &ProtocolRunner,
    mut prepared: Prepared,
    mine: &ProtocolMessage,
    theirs: &ProtocolMessage,
) -> Result<StateChannel> {
    countersign(&mut prepared.free_balance, signature_at(mine, 0)?, signature_at(theirs, 0)?, theirs.from)?;
    runner
        .store
        .remove_app_instance(&prepared.channel, &prepared.identity_hash, &prepared.free_balance)?;
    debug!("uninstall {} removed app {:?}", mine.process_id, prepared.identity_hash);
    Ok(prepared.channel)
}

/// The caller's params with the initiator's local app version filled in.
fn with_local_version(runner: &ProtocolRunner, params: &UninstallParams) -> Result<UninstallParams> {
    let channel = runner.load_channel(&params.multisig_address)?;
    let local = channel.get_app_instance(&params.app_identity_hash)?.latest_version_number;
    if let Some(requested) = params.version_number {
        if requested != local {
            return Err(EngineError::Validation(format!(
                "requested uninstall at version {}, local version is {}",
                requested, local
            )));
        }
    }
    Ok(UninstallParams { version_number: Some(local), ..params.clone() })
}

pub(super) async fn initiate(runner: &ProtocolRunner, process_id: Uuid, params: &UninstallParams) -> Result<StateChannel> {
    let params = with_local_version(runner, params).map_err(tag(PROTOCOL, 1))?;
    let wrapped = ProtocolParams::Uninstall(params.clone());
    let prepared = prepare(runner, &wrapped, &params, true).await.map_err(tag(PROTOCOL, 1))?;
    let signature = runner.sign(&prepared.free_balance).map_err(tag(PROTOCOL, 1))?;
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
    params: &UninstallParams,
) -> Result<StateChannel> {
    let prepared = prepare(runner, &message.params, params, false).await.map_err(tag(PROTOCOL, 1))?;
    let signature = runner.sign(&prepared.free_balance).map_err(tag(PROTOCOL, 1))?;
    let reply = message.reply(vec![signature]);
    let channel = finish(runner, prepared, &reply, message).map_err(tag(PROTOCOL, 1))?;
    runner.messaging.send(reply).await.map_err(tag(PROTOCOL, 2))?;
    Ok(channel)
}
