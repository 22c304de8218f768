use super::{EthereumCommitment, MultisigTransaction, SignatureSlots};
use crate::chain::abi;
use crate::error::{EngineError, Result};
use crate::types::{MinimalTransaction, MultisigOperation, ETH_ASSET_ID};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Moves value straight out of the multisig, ETH when `asset_id` is the zero
/// address and ERC20 otherwise.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawCommitment {
    pub multisig_address: Address,
    pub multisig_owners: Vec<Address>,
    pub chain_id: u64,
    pub recipient: Address,
    pub asset_id: Address,
    pub amount: U256,
    pub nonce: U256,
    pub signatures: SignatureSlots,
}

impl WithdrawCommitment {
    pub fn new(
        multisig_address: Address,
        multisig_owners: Vec<Address>,
        chain_id: u64,
        recipient: Address,
        asset_id: Address,
        amount: U256,
        nonce: U256,
    ) -> Result<Self> {
        if amount.is_zero() {
            return Err(EngineError::Validation("withdrawal amount must be positive".into()));
        }
        Ok(Self {
            multisig_address,
            multisig_owners,
            chain_id,
            recipient,
            asset_id,
            amount,
            nonce,
            signatures: [None, None],
        })
    }

    pub fn is_eth(&self) -> bool {
        self.asset_id == ETH_ASSET_ID
    }

    pub fn multisig_transaction(&self) -> MultisigTransaction {
        let (to, value, data) = if self.is_eth() {
            (self.recipient, self.amount, Bytes::default())
        } else {
            let data = abi::call(abi::ERC20_TRANSFER, &[Token::Address(self.recipient), Token::Uint(self.amount)]);
            (self.asset_id, U256::zero(), data)
        };
        MultisigTransaction {
            multisig_address: self.multisig_address,
            multisig_owners: self.multisig_owners.clone(),
            to,
            value,
            data,
            operation: MultisigOperation::Call,
            nonce: self.nonce,
            chain_id: self.chain_id,
        }
    }
}

impl EthereumCommitment for WithdrawCommitment {
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
    use crate::commitments::test_utils::{sign, signers};
    use crate::types::sort_addresses;

    fn commitment(asset: Address) -> (WithdrawCommitment, crate::signer::ChannelSigner, crate::signer::ChannelSigner) {
        let (a, b) = signers();
        let owners = sort_addresses(vec![a.address(), b.address()]);
        let c = WithdrawCommitment::new(
            Address::repeat_byte(1),
            owners,
            1,
            Address::repeat_byte(9),
            asset,
            U256::from(10),
            U256::from(3),
        )
        .unwrap();
        (c, a, b)
    }

    #[test]
    fn eth_withdrawal_sends_value_to_recipient() {
        let (c, _, _) = commitment(ETH_ASSET_ID);
        let tx = c.multisig_transaction();
        assert_eq!(tx.to, Address::repeat_byte(9));
        assert_eq!(tx.value, U256::from(10));
        assert!(tx.data.is_empty());
    }

    #[test]
    fn token_withdrawal_calls_transfer() {
        let (c, _, _) = commitment(Address::repeat_byte(7));
        let tx = c.multisig_transaction();
        assert_eq!(tx.to, Address::repeat_byte(7));
        assert!(tx.value.is_zero());
        assert_eq!(abi::selector_of(&tx.data), Some(ethers::utils::id(abi::ERC20_TRANSFER)));
    }

    #[test]
    fn multisig_commitments_need_both_signatures() {
        let (mut c, a, b) = commitment(ETH_ASSET_ID);
        let sig_a = sign(&c, &a);
        c.add_signatures(Some(sig_a), None).unwrap();
        assert!(matches!(c.assert_signatures(), Err(EngineError::MissingSignature(_))));
        let sig_b = sign(&c, &b);
        c.add_signatures(Some(sig_b), None).unwrap();
        c.assert_signatures().unwrap();
    }

    #[test]
    fn zero_withdrawal_is_rejected() {
        assert!(WithdrawCommitment::new(
            Address::zero(),
            vec![],
            1,
            Address::zero(),
            ETH_ASSET_ID,
            U256::zero(),
            U256::zero()
        )
        .is_err());
    }
}
