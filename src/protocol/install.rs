use super::utils::{countersign, expect_reply, signature_at, tag};
use super::{InstallParams, ProtocolMessage, ProtocolParams, ProtocolRunner};
use crate::app_instance::AppInstance;
use crate::commitments::{ConditionalTransactionCommitment, SetStateCommitment};
use crate::error::Result;
use crate::middleware::MiddlewareContext;
use crate::state_channel::StateChannel;
use crate::types::ProtocolName;
use log::debug;
use uuid::Uuid;

const PROTOCOL: ProtocolName = ProtocolName::Install;

struct Prepared {
    channel: StateChannel,
    app: AppInstance,
    conditional: ConditionalTransactionCommitment,
    free_balance: SetStateCommitment,
}

async fn prepare(
    runner: &ProtocolRunner,
    wrapped: &ProtocolParams,
    params: &InstallParams,
    is_initiator: bool,
) -> Result<Prepared> {
    let channel = runner.load_channel(&params.multisig_address)?;
    let proposal = channel.get_proposal(&params.proposal_identity_hash)?;

    let context = MiddlewareContext {
        protocol: PROTOCOL,
        is_initiator,
        params: wrapped,
        channel: &channel,
        proposal: Some(proposal),
        app: None,
    };
    runner
        .middleware
        .validate(Some(proposal.app_interface.addr), &context)
        .await?;

    let app = proposal.to_app_instance();
    let next = channel.install_app(app.clone(), runner.free_balance_timeout())?;
    let conditional = ConditionalTransactionCommitment::new(
        &runner.network,
        next.multisig_owners(),
        next.free_balance.identity_hash,
        &app,
    );
    let free_balance = SetStateCommitment::for_app(runner.network.challenge_registry, &next.free_balance);
    Ok(Prepared { channel: next, app, conditional, free_balance })
}

fn persist(runner: &ProtocolRunner, prepared: Prepared, process_id: Uuid) -> Result<StateChannel> {
    runner.store.create_app_instance(
        &prepared.channel,
        &prepared.app.identity_hash,
        &prepared.free_balance,
        &prepared.conditional,
    )?;
    debug!("install {} persisted app {:?}", process_id, prepared.app.identity_hash);
    Ok(prepared.channel)
}

pub(super) async fn initiate(runner: &ProtocolRunner, process_id: Uuid, params: &InstallParams) -> Result<StateChannel> {
    let wrapped = ProtocolParams::Install(params.clone());
    let mut prepared = prepare(runner, &wrapped, params, true).await.map_err(tag(PROTOCOL, 1))?;
    let conditional_sig = runner.sign(&prepared.conditional).map_err(tag(PROTOCOL, 1))?;
    let opening = ProtocolMessage::new(process_id, 1, params.initiator_identifier, params.responder_identifier, wrapped)
        .with_signatures(vec![conditional_sig]);

    let second = runner.request(opening.clone()).await.map_err(tag(PROTOCOL, 1))?;

    let step_two = |prepared: &mut Prepared| -> Result<ProtocolMessage> {
        expect_reply(&opening, &second)?;
        let counterparty = second.from;
        countersign(&mut prepared.conditional, conditional_sig, signature_at(&second, 0)?, counterparty)?;
        let free_balance_sig = runner.sign(&prepared.free_balance)?;
        countersign(&mut prepared.free_balance, free_balance_sig, signature_at(&second, 1)?, counterparty)?;
        Ok(second.reply(vec![free_balance_sig]))
    };
    let third = step_two(&mut prepared).map_err(tag(PROTOCOL, 2))?;
    let channel = persist(runner, prepared, process_id).map_err(tag(PROTOCOL, 3))?;
    runner.messaging.send(third).await.map_err(tag(PROTOCOL, 3))?;
    Ok(channel)
}

pub(super) async fn respond(
    runner: &ProtocolRunner,
    message: &ProtocolMessage,
    params: &InstallParams,
) -> Result<StateChannel> {
    let mut prepared = prepare(runner, &message.params, params, false).await.map_err(tag(PROTOCOL, 1))?;

    let step_one = |prepared: &mut Prepared| -> Result<ProtocolMessage> {
        let conditional_sig = runner.sign(&prepared.conditional)?;
        let free_balance_sig = runner.sign(&prepared.free_balance)?;
        countersign(&mut prepared.conditional, conditional_sig, signature_at(message, 0)?, message.from)?;
        Ok(message.reply(vec![conditional_sig, free_balance_sig]))
    };
    let second = step_one(&mut prepared).map_err(tag(PROTOCOL, 1))?;

    let third = runner.request(second.clone()).await.map_err(tag(PROTOCOL, 2))?;

    let step_three = |prepared: &mut Prepared| -> Result<()> {
        expect_reply(&second, &third)?;
        countersign(&mut prepared.free_balance, signature_at(&second, 1)?, signature_at(&third, 0)?, third.from)
    };
    step_three(&mut prepared).map_err(tag(PROTOCOL, 3))?;
    persist(runner, prepared, message.process_id).map_err(tag(PROTOCOL, 3))
}
