//! Signed descriptions of on-chain transactions.
//!
//! Every commitment carries exactly the data needed to rebuild its transaction
//! byte for byte, plus up to two signatures filed by participant order (the
//! canonical ascending order of the owners), never by arrival order.

mod conditional;
mod multisig;
mod set_state;
mod setup;
mod withdraw;

pub use conditional::ConditionalTransactionCommitment;
pub use multisig::MultisigTransaction;
pub use set_state::SetStateCommitment;
pub use setup::SetupCommitment;
pub use withdraw::WithdrawCommitment;

use crate::error::{EngineError, Result};
use crate::signer::recover_signer;
use crate::types::MinimalTransaction;
use ethers::types::{Address, Bytes, Signature, H256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub type SignatureSlots = [Option<Signature>; 2];

pub trait EthereumCommitment: Clone + Serialize + DeserializeOwned {
    fn signing_digest(&self) -> H256;

    /// The transaction this commitment authorizes, built from the signatures
    /// currently held.
    fn transaction(&self) -> Result<MinimalTransaction>;

    /// Signers in canonical order; slot `i` holds `participants()[i]`'s signature.
    fn participants(&self) -> &[Address];

    fn signature_slots(&self) -> &SignatureSlots;

    fn signature_slots_mut(&mut self) -> &mut SignatureSlots;

    /// Fewest signatures under which the transaction is still redeemable.
    fn min_signatures(&self) -> usize {
        2
    }

    /// Files each present signature into the slot of the participant it
    /// recovers to. Nothing changes unless every signature is valid.
    fn add_signatures(&mut self, first: Option<Signature>, second: Option<Signature>) -> Result<()> {
        let digest = self.signing_digest();
        let participants = self.participants().to_vec();
        let mut slots = self.signature_slots().clone();
        for signature in [first, second].into_iter().flatten() {
            let recovered = recover_signer(digest, &signature)?;
            let index = participants
                .iter()
                .position(|p| *p == recovered)
                .ok_or_else(|| EngineError::Signature { recovered, expected: participants.clone() })?;
            slots[index] = Some(signature);
        }
        *self.signature_slots_mut() = slots;
        Ok(())
    }

    fn signature_count(&self) -> usize {
        self.signature_slots().iter().filter(|s| s.is_some()).count()
    }

    fn is_fully_signed(&self) -> bool {
        self.signature_count() == 2
    }

    fn assert_signatures(&self) -> Result<()> {
        let count = self.signature_count();
        if count == 0 {
            return Err(EngineError::MissingSignature("commitment carries no signatures".into()));
        }
        if count < self.min_signatures() {
            return Err(EngineError::MissingSignature(format!(
                "commitment carries {} of {} required signatures",
                count,
                self.min_signatures()
            )));
        }
        let digest = self.signing_digest();
        for (slot, participant) in self.signature_slots().iter().zip(self.participants()) {
            if let Some(signature) = slot {
                let recovered = recover_signer(digest, signature)?;
                if recovered != *participant {
                    return Err(EngineError::Signature { recovered, expected: vec![*participant] });
                }
            }
        }
        Ok(())
    }

    /// Signatures present, in participant order.
    fn ordered_signatures(&self) -> Vec<Signature> {
        self.signature_slots().iter().flatten().copied().collect()
    }

    /// JSON record carrying a freshly derived `transactionData`.
    fn to_json(&self) -> Result<serde_json::Value> {
        let data = self.transaction()?.data;
        Ok(serde_json::to_value(CommitmentRecord { commitment: self.clone(), transaction_data: data })?)
    }

    /// Rebuilds a commitment from its JSON record. The stored `transactionData`
    /// is ignored so a stale encoding can never be resubmitted.
    fn from_json(value: serde_json::Value) -> Result<Self> {
        let record: CommitmentRecord<Self> = serde_json::from_value(value)?;
        record.commitment.check_integrity()?;
        Ok(record.commitment)
    }

    /// Checks fields that are derived from others after a record is read back.
    fn check_integrity(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitmentRecord<C> {
    #[serde(flatten)]
    commitment: C,
    transaction_data: Bytes,
}

/// Any of the four commitment kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commitment {
    Setup(SetupCommitment),
    ConditionalTransaction(ConditionalTransactionCommitment),
    SetState(SetStateCommitment),
    Withdraw(WithdrawCommitment),
}

impl Commitment {
    pub fn signing_digest(&self) -> H256 {
        match self {
            Commitment::Setup(c) => c.signing_digest(),
            Commitment::ConditionalTransaction(c) => c.signing_digest(),
            Commitment::SetState(c) => c.signing_digest(),
            Commitment::Withdraw(c) => c.signing_digest(),
        }
    }

    pub fn transaction(&self) -> Result<MinimalTransaction> {
        match self {
            Commitment::Setup(c) => c.transaction(),
            Commitment::ConditionalTransaction(c) => c.transaction(),
            Commitment::SetState(c) => c.transaction(),
            Commitment::Withdraw(c) => c.transaction(),
        }
    }

    pub fn add_signatures(&mut self, first: Option<Signature>, second: Option<Signature>) -> Result<()> {
        match self {
            Commitment::Setup(c) => c.add_signatures(first, second),
            Commitment::ConditionalTransaction(c) => c.add_signatures(first, second),
            Commitment::SetState(c) => c.add_signatures(first, second),
            Commitment::Withdraw(c) => c.add_signatures(first, second),
        }
    }

    pub fn assert_signatures(&self) -> Result<()> {
        match self {
            Commitment::Setup(c) => c.assert_signatures(),
            Commitment::ConditionalTransaction(c) => c.assert_signatures(),
            Commitment::SetState(c) => c.assert_signatures(),
            Commitment::Withdraw(c) => c.assert_signatures(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Commitment::Setup(_) => "setup",
            Commitment::ConditionalTransaction(_) => "conditional",
            Commitment::SetState(_) => "set_state",
            Commitment::Withdraw(_) => "withdraw",
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        let (kind, mut value) = match self {
            Commitment::Setup(c) => ("setup", c.to_json()?),
            Commitment::ConditionalTransaction(c) => ("conditional", c.to_json()?),
            Commitment::SetState(c) => ("set_state", c.to_json()?),
            Commitment::Withdraw(c) => ("withdraw", c.to_json()?),
        };
        if let Some(object) = value.as_object_mut() {
            object.insert("type".into(), serde_json::Value::String(kind.into()));
        }
        Ok(value)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Serialization {
                format: "json".into(),
                details: "commitment record has no type".into(),
            })?
            .to_string();
        match kind.as_str() {
            "setup" => Ok(Commitment::Setup(SetupCommitment::from_json(value)?)),
            "conditional" => Ok(Commitment::ConditionalTransaction(ConditionalTransactionCommitment::from_json(value)?)),
            "set_state" => Ok(Commitment::SetState(SetStateCommitment::from_json(value)?)),
            "withdraw" => Ok(Commitment::Withdraw(WithdrawCommitment::from_json(value)?)),
            other => Err(EngineError::Serialization {
                format: "json".into(),
                details: format!("unknown commitment type {other}"),
            }),
        }
    }
}
