use super::{EthereumCommitment, MultisigTransaction, SignatureSlots};
use crate::app_instance::AppInstance;
use crate::chain::abi;
use crate::error::Result;
use crate::types::{MinimalTransaction, MultisigOperation, NetworkContext};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Pays out an installed app through its interpreter once the challenge
/// registry holds the app's outcome.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalTransactionCommitment {
    pub multisig_address: Address,
    pub multisig_owners: Vec<Address>,
    pub chain_id: u64,
    pub conditional_transaction_delegate_target: Address,
    pub challenge_registry: Address,
    pub free_balance_identity_hash: H256,
    pub app_identity_hash: H256,
    pub interpreter_addr: Address,
    pub interpreter_params: Bytes,
    pub nonce: U256,
    pub signatures: SignatureSlots,
}

impl ConditionalTransactionCommitment {
    pub fn new(
        network: &NetworkContext,
        multisig_owners: Vec<Address>,
        free_balance_identity_hash: H256,
        app: &AppInstance,
    ) -> Self {
        Self {
            multisig_address: app.multisig_address,
            multisig_owners,
            chain_id: network.chain_id,
            conditional_transaction_delegate_target: network.conditional_transaction_delegate_target,
            challenge_registry: network.challenge_registry,
            free_balance_identity_hash,
            app_identity_hash: app.identity_hash,
            interpreter_addr: app.interpreter_params.interpreter_address(network),
            interpreter_params: app.interpreter_params.encode(),
            nonce: U256::from(app.app_seq_no),
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
                abi::EXECUTE_EFFECT_OF_INTERPRETED_APP_OUTCOME,
                &[
                    Token::Address(self.challenge_registry),
                    Token::FixedBytes(self.free_balance_identity_hash.as_bytes().to_vec()),
                    Token::FixedBytes(self.app_identity_hash.as_bytes().to_vec()),
                    Token::Address(self.interpreter_addr),
                    Token::Bytes(self.interpreter_params.to_vec()),
                ],
            ),
            operation: MultisigOperation::DelegateCall,
            nonce: self.nonce,
            chain_id: self.chain_id,
        }
    }
}

impl EthereumCommitment for ConditionalTransactionCommitment {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_instance::{AppInterface, AppProposal};
    use crate::commitments::test_utils::{sign, signers};
    use crate::error::EngineError;
    use crate::outcome::InterpreterParams;
    use crate::signer::{recover_signer, ChannelSigner};
    use crate::types::{sort_addresses, ETH_ASSET_ID};

    fn network() -> NetworkContext {
        NetworkContext {
            chain_id: 1337,
            challenge_registry: Address::repeat_byte(0xee),
            conditional_transaction_delegate_target: Address::repeat_byte(0xc0),
            single_asset_two_party_coin_transfer_interpreter: Address::repeat_byte(0x32),
            ..Default::default()
        }
    }

    fn commitment(a: &ChannelSigner, b: &ChannelSigner) -> ConditionalTransactionCommitment {
        let mut proposal = AppProposal {
            identity_hash: H256::zero(),
            multisig_address: Address::repeat_byte(0xcc),
            initiator_identifier: a.address(),
            responder_identifier: b.address(),
            app_interface: AppInterface {
                addr: Address::repeat_byte(0xaa),
                state_encoding: String::new(),
                action_encoding: None,
            },
            default_timeout: U256::from(10),
            state_timeout: U256::from(10),
            initial_state: Bytes::default(),
            app_seq_no: 3,
            interpreter_params: InterpreterParams::SingleAssetTwoPartyCoinTransfer {
                limit: U256::from(50),
                token_address: ETH_ASSET_ID,
            },
            initiator_deposit: U256::from(50),
            initiator_deposit_asset_id: ETH_ASSET_ID,
            responder_deposit: U256::zero(),
            responder_deposit_asset_id: ETH_ASSET_ID,
            meta: None,
        };
        proposal.identity_hash = proposal.identity().identity_hash();
        let owners = sort_addresses(vec![a.address(), b.address()]);
        ConditionalTransactionCommitment::new(&network(), owners, H256::repeat_byte(0xfb), &proposal.to_app_instance())
    }

    #[test]
    fn binds_app_to_its_interpreter() {
        let (a, b) = signers();
        let c = commitment(&a, &b);
        assert_eq!(c.interpreter_addr, Address::repeat_byte(0x32));
        assert_eq!(c.nonce, U256::from(3));
        let tx = c.multisig_transaction();
        assert_eq!(tx.to, Address::repeat_byte(0xc0));
        assert_eq!(tx.operation, MultisigOperation::DelegateCall);
        assert_eq!(&tx.data[..4], &ethers::utils::id(abi::EXECUTE_EFFECT_OF_INTERPRETED_APP_OUTCOME)[..]);
    }

    #[test]
    fn needs_both_owners() {
        let (a, b) = signers();
        let mut c = commitment(&a, &b);
        let (sig_a, sig_b) = (sign(&c, &a), sign(&c, &b));
        c.add_signatures(Some(sig_b), None).unwrap();
        assert!(matches!(c.assert_signatures(), Err(EngineError::MissingSignature(_))));
        c.add_signatures(Some(sig_a), Some(sig_b)).unwrap();
        c.assert_signatures().unwrap();
        for (slot, owner) in c.signatures.iter().zip(c.participants()) {
            let sig = slot.as_ref().unwrap();
            assert_eq!(recover_signer(c.signing_digest(), sig).unwrap(), *owner);
        }
    }

    #[test]
    fn json_round_trip_keeps_digest_and_transaction() {
        let (a, b) = signers();
        let mut c = commitment(&a, &b);
        let (sig_a, sig_b) = (sign(&c, &a), sign(&c, &b));
        c.add_signatures(Some(sig_a), Some(sig_b)).unwrap();
        let restored = ConditionalTransactionCommitment::from_json(c.to_json().unwrap()).unwrap();
        assert_eq!(restored, c);
        assert_eq!(restored.signing_digest(), c.signing_digest());
        assert_eq!(restored.transaction().unwrap(), c.transaction().unwrap());
    }
}
