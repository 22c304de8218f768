use super::{ProtocolMessage, ProtocolRunner};
use crate::commitments::EthereumCommitment;
use crate::error::{EngineError, Result};
use crate::signer::assert_signed_by;
use crate::state_channel::StateChannel;
use crate::types::ProtocolName;
use ethers::types::{Address, Signature, U256};

pub(super) fn tag(protocol: ProtocolName, seq: u8) -> impl Fn(EngineError) -> EngineError {
    move |e| e.at_step(protocol, seq)
}

impl ProtocolRunner {
    pub(super) fn sign<C: EthereumCommitment>(&self, commitment: &C) -> Result<Signature> {
        self.signer.sign_digest(commitment.signing_digest())
    }

    pub(super) fn load_channel(&self, multisig: &Address) -> Result<StateChannel> {
        self.store
            .get_state_channel(multisig)?
            .ok_or_else(|| EngineError::not_found("state channel", multisig))
    }

    pub(super) async fn request(&self, message: ProtocolMessage) -> Result<ProtocolMessage> {
        self.messaging.request(message, self.config.protocol_timeout()).await
    }

    pub(super) fn free_balance_timeout(&self) -> U256 {
        U256::from(self.config.free_balance_timeout)
    }
}

/// Checks that `reply` continues the run `sent` opened or advanced.
pub(super) fn expect_reply(sent: &ProtocolMessage, reply: &ProtocolMessage) -> Result<()> {
    if reply.process_id != sent.process_id || reply.protocol != sent.protocol {
        return Err(EngineError::Validation(format!(
            "reply belongs to {} {}",
            reply.protocol, reply.process_id
        )));
    }
    if reply.seq != sent.seq + 1 {
        return Err(EngineError::Validation(format!("expected seq {}, got {}", sent.seq + 1, reply.seq)));
    }
    if reply.from != sent.to {
        return Err(EngineError::Validation(format!("reply from {:?}, expected {:?}", reply.from, sent.to)));
    }
    Ok(())
}

pub(super) fn signature_at(message: &ProtocolMessage, index: usize) -> Result<Signature> {
    message.signatures.get(index).copied().ok_or_else(|| {
        EngineError::MissingSignature(format!(
            "{} seq {} carries no signature at position {}",
            message.protocol, message.seq, index
        ))
    })
}

/// Verifies `theirs` came from `counterparty`, then files both signatures and
/// checks the commitment is fully signed.
pub(super) fn countersign<C: EthereumCommitment>(
    commitment: &mut C,
    mine: Signature,
    theirs: Signature,
    counterparty: Address,
) -> Result<()> {
    assert_signed_by(commitment.signing_digest(), &theirs, counterparty)?;
    commitment.add_signatures(Some(mine), Some(theirs))?;
    commitment.assert_signatures()?;
    if !commitment.is_fully_signed() {
        return Err(EngineError::MissingSignature("commitment is missing a party's signature".into()));
    }
    Ok(())
}
