use super::{EthereumCommitment, MultisigTransaction, SignatureSlots};
use crate::chain::abi;
use crate::error::Result;
use crate::types::{MinimalTransaction, MultisigOperation, NetworkContext};
use ethers::abi::Token;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// Binds the free balance outcome into the multisig.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetupCommitment {
    pub multisig_address: Address,
    pub multisig_owners: Vec<Address>,
    pub chain_id: u64,
    pub conditional_transaction_delegate_target: Address,
    pub challenge_registry: Address,
    pub multi_asset_interpreter: Address,
    pub free_balance_identity_hash: H256,
    pub signatures: SignatureSlots,
}

impl SetupCommitment {
    pub fn new(
        network: &NetworkContext,
        multisig_address: Address,
        multisig_owners: Vec<Address>,
        free_balance_identity_hash: H256,
    ) -> Self {
        Self {
            multisig_address,
            multisig_owners,
            chain_id: network.chain_id,
            conditional_transaction_delegate_target: network.conditional_transaction_delegate_target,
            challenge_registry: network.challenge_registry,
            multi_asset_interpreter: network.multi_asset_multi_party_coin_transfer_interpreter,
            free_balance_identity_hash,
            signatures: [None, None],
        }
    }

    pub fn multisig_transaction(&self) -> MultisigTransaction {
        MultisigTransaction {
            multisig_address: self.multisig_address,
            multisig_owners: self.multisig_owners.clone(),
            to: self.conditional_transaction_delegate_target,
            value: U256::zero(),
            data: abi::call(
                abi::EXECUTE_EFFECT_OF_FREE_BALANCE,
                &[
                    Token::Address(self.challenge_registry),
                    Token::FixedBytes(self.free_balance_identity_hash.as_bytes().to_vec()),
                    Token::Address(self.multi_asset_interpreter),
                ],
            ),
            operation: MultisigOperation::DelegateCall,
            nonce: U256::zero(),
            chain_id: self.chain_id,
        }
    }
}

impl EthereumCommitment for SetupCommitment {
    fn signing_digest(&self) -> H256 {
        self.multisig_transaction().digest()
    }

    fn transaction(&self) -> Result<MinimalTransaction> {
        Ok(self.multisig_transaction().to_minimal(&self.ordered_signatures()))
    }

    fn participants(&self) -> &[Address] {
        &self.multisig_owners
    }

    fn signature_slots(&self) -> &SignatureSlots {
        &self.signatures
    }

    fn signature_slots_mut(&mut self) -> &mut SignatureSlots {
        &mut self.signatures
    }
}
