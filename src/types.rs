use crate::error::{EngineError, Result};
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// ETH is represented by the zero address wherever an asset id is expected.
pub const ETH_ASSET_ID: Address = Address::zero();

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolName {
    Setup,
    Propose,
    Install,
    Uninstall,
    TakeAction,
}

impl fmt::Display for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolName::Setup => "setup",
            ProtocolName::Propose => "propose",
            ProtocolName::Install => "install",
            ProtocolName::Uninstall => "uninstall",
            ProtocolName::TakeAction => "take_action",
        };
        f.write_str(name)
    }
}

/// Leading byte of every signed digest, keeps multisig and challenge registry
/// signatures from being replayed against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommitmentTarget {
    Multisig = 0,
    SetState = 1,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MultisigOperation {
    Call = 0,
    DelegateCall = 1,
}

/// Deployment addresses of a channel's multisig.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContractAddresses {
    pub proxy_factory: Address,
    pub multisig_mastercopy: Address,
}

/// A transaction as it would be handed to a chain client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MinimalTransaction {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Contract addresses of the deployment a node talks to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct NetworkContext {
    pub chain_id: u64,
    pub challenge_registry: Address,
    pub conditional_transaction_delegate_target: Address,
    pub identity_app: Address,
    pub multi_asset_multi_party_coin_transfer_interpreter: Address,
    pub single_asset_two_party_coin_transfer_interpreter: Address,
    pub two_party_fixed_outcome_interpreter: Address,
    pub proxy_factory: Address,
    pub multisig_mastercopy: Address,
    /// App definitions that may be proposed, by name.
    pub apps: BTreeMap<String, Address>,
}

impl NetworkContext {
    pub fn contract_addresses(&self) -> ContractAddresses {
        ContractAddresses { proxy_factory: self.proxy_factory, multisig_mastercopy: self.multisig_mastercopy }
    }
}

/// Name <-> address lookup over a [`NetworkContext`], built once. Apps listed
/// under `apps` are the only definitions that may be proposed.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    by_name: HashMap<String, Address>,
    by_address: HashMap<Address, String>,
    apps: HashMap<Address, String>,
}

impl ContractRegistry {
    pub fn new(network: &NetworkContext) -> Result<Self> {
        let mut registry = ContractRegistry::default();
        let core = [
            ("ChallengeRegistry", network.challenge_registry),
            ("ConditionalTransactionDelegateTarget", network.conditional_transaction_delegate_target),
            ("IdentityApp", network.identity_app),
            ("MultiAssetMultiPartyCoinTransferInterpreter", network.multi_asset_multi_party_coin_transfer_interpreter),
            ("SingleAssetTwoPartyCoinTransferInterpreter", network.single_asset_two_party_coin_transfer_interpreter),
            ("TwoPartyFixedOutcomeInterpreter", network.two_party_fixed_outcome_interpreter),
            ("ProxyFactory", network.proxy_factory),
            ("MinimumViableMultisig", network.multisig_mastercopy),
        ];
        for (name, address) in core {
            registry.insert(name, address)?;
        }
        for (name, address) in &network.apps {
            registry.insert(name, *address)?;
            registry.apps.insert(*address, name.clone());
        }
        Ok(registry)
    }

    fn insert(&mut self, name: &str, address: Address) -> Result<()> {
        if address.is_zero() {
            return Ok(());
        }
        if let Some(existing) = self.by_address.get(&address) {
            return Err(EngineError::Config(format!(
                "address {:?} registered as both {} and {}",
                address, existing, name
            )));
        }
        self.by_name.insert(name.to_string(), address);
        self.by_address.insert(address, name.to_string());
        Ok(())
    }

    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, address: &Address) -> Option<&str> {
        self.by_address.get(address).map(String::as_str)
    }

    pub fn is_registered_app(&self, address: &Address) -> bool {
        self.apps.contains_key(address)
    }
}

/// On-chain identity of an app instance as the challenge registry sees it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppIdentity {
    pub multisig_address: Address,
    pub channel_nonce: U256,
    pub participants: Vec<Address>,
    pub app_definition: Address,
    pub default_timeout: U256,
}

impl AppIdentity {
    pub fn identity_hash(&self) -> H256 {
        let participants_hash = keccak256(pack_addresses(&self.participants));
        H256(keccak256(encode(&[
            Token::Address(self.multisig_address),
            Token::Uint(self.channel_nonce),
            Token::FixedBytes(participants_hash.to_vec()),
            Token::Address(self.app_definition),
            Token::Uint(self.default_timeout),
        ])))
    }

    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.multisig_address),
            Token::Uint(self.channel_nonce),
            Token::Array(self.participants.iter().map(|p| Token::Address(*p)).collect()),
            Token::Address(self.app_definition),
            Token::Uint(self.default_timeout),
        ])
    }
}

/// Ascending address order, the canonical participant order of every commitment.
pub fn sort_addresses(mut addresses: Vec<Address>) -> Vec<Address> {
    addresses.sort();
    addresses
}

/// `abi.encodePacked(address[])`: each element left padded to 32 bytes.
pub fn pack_addresses(addresses: &[Address]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addresses.len() * 32);
    for address in addresses {
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(address.as_bytes());
    }
    out
}

pub fn u256_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

pub fn hash_bytes(bytes: &[u8]) -> H256 {
    H256(keccak256(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn registry_names_contracts_and_apps() {
        let mut network = NetworkContext {
            challenge_registry: addr(1),
            identity_app: addr(2),
            ..Default::default()
        };
        network.apps.insert("SimpleTransferApp".into(), addr(9));
        let registry = ContractRegistry::new(&network).unwrap();
        assert_eq!(registry.address_of("ChallengeRegistry"), Some(addr(1)));
        assert_eq!(registry.name_of(&addr(1)), Some("ChallengeRegistry"));
        assert_eq!(registry.name_of(&addr(9)), Some("SimpleTransferApp"));
        assert!(registry.is_registered_app(&addr(9)));
        assert!(!registry.is_registered_app(&addr(2)));
    }

    #[test]
    fn registry_rejects_duplicate_addresses() {
        let network = NetworkContext { challenge_registry: addr(1), identity_app: addr(1), ..Default::default() };
        assert!(matches!(ContractRegistry::new(&network), Err(EngineError::Config(_))));
    }

    #[test]
    fn identity_hash_depends_on_channel_nonce() {
        let identity = AppIdentity {
            multisig_address: addr(3),
            channel_nonce: U256::one(),
            participants: vec![addr(4), addr(5)],
            app_definition: addr(6),
            default_timeout: U256::from(100),
        };
        let mut next = identity.clone();
        next.channel_nonce = U256::from(2);
        assert_ne!(identity.identity_hash(), next.identity_hash());
        assert_eq!(identity.identity_hash(), identity.clone().identity_hash());
    }

    #[test]
    fn packed_addresses_are_word_aligned() {
        let packed = pack_addresses(&[addr(0xaa), addr(0xbb)]);
        assert_eq!(packed.len(), 64);
        assert_eq!(&packed[12..32], addr(0xaa).as_bytes());
    }
}
