use crate::chain::abi;
use crate::types::{hash_bytes, pack_addresses, u256_word, CommitmentTarget, MinimalTransaction, MultisigOperation};
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::keccak256;

const DOMAIN_NAME: &str = "StateChannelMultisig";
const DOMAIN_VERSION: &str = "1";

/// A transaction executed by the channel multisig once both owners signed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigTransaction {
    pub multisig_address: Address,
    /// Canonical order.
    pub multisig_owners: Vec<Address>,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub operation: MultisigOperation,
    pub nonce: U256,
    pub chain_id: u64,
}

impl MultisigTransaction {
    pub fn domain_separator(&self) -> H256 {
        let salt = keccak256(pack_addresses(&self.multisig_owners));
        H256(keccak256(encode(&[
            Token::FixedBytes(keccak256(DOMAIN_NAME).to_vec()),
            Token::FixedBytes(keccak256(DOMAIN_VERSION).to_vec()),
            Token::Uint(U256::from(self.chain_id)),
            Token::Address(self.multisig_address),
            Token::FixedBytes(salt.to_vec()),
        ])))
    }

    /// `keccak256(tag ‖ owners ‖ to ‖ value ‖ keccak256(data) ‖ operation ‖ domainSeparator ‖ nonce)`
    pub fn digest(&self) -> H256 {
        let mut packed = Vec::with_capacity(1 + 32 * self.multisig_owners.len() + 20 + 32 * 4 + 1);
        packed.push(CommitmentTarget::Multisig as u8);
        packed.extend(pack_addresses(&self.multisig_owners));
        packed.extend_from_slice(self.to.as_bytes());
        packed.extend_from_slice(&u256_word(self.value));
        packed.extend_from_slice(hash_bytes(&self.data).as_bytes());
        packed.push(self.operation as u8);
        packed.extend_from_slice(self.domain_separator().as_bytes());
        packed.extend_from_slice(&u256_word(self.nonce));
        hash_bytes(&packed)
    }

    /// Call to the multisig's `execTransaction` carrying `signatures` in owner order.
    pub fn to_minimal(&self, signatures: &[Signature]) -> MinimalTransaction {
        MinimalTransaction {
            to: self.multisig_address,
            value: U256::zero(),
            data: abi::exec_transaction(self.to, self.value, &self.data, self.operation as u8, signatures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx() -> MultisigTransaction {
        MultisigTransaction {
            multisig_address: Address::repeat_byte(1),
            multisig_owners: vec![Address::repeat_byte(2), Address::repeat_byte(3)],
            to: Address::repeat_byte(4),
            value: U256::from(5),
            data: Bytes::from(vec![1, 2, 3]),
            operation: MultisigOperation::Call,
            nonce: U256::zero(),
            chain_id: 1,
        }
    }

    #[test]
    fn digest_binds_chain_and_nonce() {
        let base = tx();
        let mut other_chain = base.clone();
        other_chain.chain_id = 2;
        let mut other_nonce = base.clone();
        other_nonce.nonce = U256::one();
        assert_ne!(base.digest(), other_chain.digest());
        assert_ne!(base.digest(), other_nonce.digest());
        assert_eq!(base.digest(), tx().digest());
    }

    #[test]
    fn execution_targets_multisig() {
        let minimal = tx().to_minimal(&[]);
        assert_eq!(minimal.to, Address::repeat_byte(1));
        assert_eq!(abi::selector_of(&minimal.data), Some(ethers::utils::id(abi::EXEC_TRANSACTION)));
    }
}
