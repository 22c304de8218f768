//! Registration contract for application outcome logic.
//!
//! The engine never interprets app state itself. Every app definition that may
//! be installed registers an [`AppLogic`] here; take-action runs its transition
//! function before anything is signed and uninstall reads its outcome.

use crate::error::{EngineError, Result};
use crate::outcome::{decode_coin_transfer_pair, encode_coin_transfer_pair, CoinTransfer};
use crate::types::NetworkContext;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

pub trait AppLogic: Send + Sync {
    /// Pure transition function, `state'` for `(state, action)`.
    fn apply_action(&self, state: &[u8], action: &[u8]) -> Result<Bytes>;

    /// ABI encoded outcome in the layout of the app's outcome type.
    fn compute_outcome(&self, state: &[u8]) -> Result<Bytes>;

    /// Participant allowed to move next, `None` when either may.
    fn turn_taker(&self, _state: &[u8], _participants: &[Address]) -> Option<Address> {
        None
    }
}

#[derive(Clone, Default)]
pub struct AppRegistry {
    apps: HashMap<Address, Arc<dyn AppLogic>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, app_definition: Address, logic: Arc<dyn AppLogic>) -> &mut Self {
        self.apps.insert(app_definition, logic);
        self
    }

    pub fn with(mut self, app_definition: Address, logic: Arc<dyn AppLogic>) -> Self {
        self.register(app_definition, logic);
        self
    }

    pub fn get(&self, app_definition: &Address) -> Result<Arc<dyn AppLogic>> {
        self.apps
            .get(app_definition)
            .cloned()
            .ok_or(EngineError::UnknownAppDefinition(*app_definition))
    }

    pub fn contains(&self, app_definition: &Address) -> bool {
        self.apps.contains_key(app_definition)
    }

    /// Registers the built-in logic of every app the network lists by a known name.
    pub fn for_network(network: &NetworkContext) -> Self {
        let mut registry = Self::new();
        for (name, address) in &network.apps {
            match name.as_str() {
                SIMPLE_TRANSFER_APP => {
                    registry.register(*address, Arc::new(SimpleTransferApp));
                }
                other => warn!("no built-in logic for app {} at {:?}", other, address),
            }
        }
        registry
    }
}

pub const SIMPLE_TRANSFER_APP: &str = "SimpleTransferApp";

pub const SIMPLE_TRANSFER_STATE_ENCODING: &str = "tuple(address to, uint256 amount)[2] coinTransfers";
pub const SIMPLE_TRANSFER_ACTION_ENCODING: &str = "uint256 amount";

/// Single asset transfer app: `coinTransfers[0]` pays `coinTransfers[1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleTransferApp;

impl SimpleTransferApp {
    pub fn initial_state(sender: Address, receiver: Address, amount: U256) -> Bytes {
        encode_coin_transfer_pair(&[CoinTransfer::new(sender, amount), CoinTransfer::new(receiver, U256::zero())])
    }

    pub fn encode_action(amount: U256) -> Bytes {
        encode(&[Token::Uint(amount)]).into()
    }

    fn decode_action(action: &[u8]) -> Result<U256> {
        match decode(&[ParamType::Uint(256)], action)?.into_iter().next() {
            Some(Token::Uint(amount)) => Ok(amount),
            _ => Err(EngineError::Abi("transfer action is not a uint256".into())),
        }
    }
}

impl AppLogic for SimpleTransferApp {
    fn apply_action(&self, state: &[u8], action: &[u8]) -> Result<Bytes> {
        let [sender, receiver] = decode_coin_transfer_pair(state)?;
        let amount = Self::decode_action(action)?;
        if amount.is_zero() {
            return Err(EngineError::Validation("transfer amount must be positive".into()));
        }
        if amount > sender.amount {
            return Err(EngineError::Validation(format!(
                "cannot transfer {} with balance {}",
                amount, sender.amount
            )));
        }
        Ok(encode_coin_transfer_pair(&[
            CoinTransfer::new(sender.to, sender.amount - amount),
            CoinTransfer::new(receiver.to, receiver.amount + amount),
        ]))
    }

    fn compute_outcome(&self, state: &[u8]) -> Result<Bytes> {
        let transfers = decode_coin_transfer_pair(state)?;
        Ok(encode_coin_transfer_pair(&transfers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_moves_balance() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let state = SimpleTransferApp::initial_state(a, b, U256::from(100));
        let next = SimpleTransferApp.apply_action(&state, &SimpleTransferApp::encode_action(U256::from(30))).unwrap();
        let [sender, receiver] = decode_coin_transfer_pair(&next).unwrap();
        assert_eq!(sender.amount, U256::from(70));
        assert_eq!(receiver.amount, U256::from(30));
    }

    #[test]
    fn transfer_cannot_overdraw() {
        let state = SimpleTransferApp::initial_state(Address::zero(), Address::repeat_byte(2), U256::from(5));
        let err = SimpleTransferApp.apply_action(&state, &SimpleTransferApp::encode_action(U256::from(6)));
        assert!(matches!(err, Err(EngineError::Validation(_))));
    }

    #[test]
    fn network_apps_get_built_in_logic() {
        let mut network = NetworkContext::default();
        network.apps.insert(SIMPLE_TRANSFER_APP.into(), Address::repeat_byte(7));
        network.apps.insert("TicTacToeApp".into(), Address::repeat_byte(8));
        let registry = AppRegistry::for_network(&network);
        assert!(registry.contains(&Address::repeat_byte(7)));
        assert!(!registry.contains(&Address::repeat_byte(8)));
    }

    #[test]
    fn unknown_definition_is_rejected() {
        let registry = AppRegistry::new().with(Address::repeat_byte(9), Arc::new(SimpleTransferApp));
        assert!(registry.get(&Address::repeat_byte(9)).is_ok());
        assert!(matches!(
            registry.get(&Address::repeat_byte(8)),
            Err(EngineError::UnknownAppDefinition(_))
        ));
    }
}
