//! The free balance app: each owner's withdrawable balance per asset plus the
//! set of apps currently funded out of it.

use crate::app_instance::{AppInstance, AppInterface};
use crate::error::{EngineError, Result};
use crate::outcome::{CoinTransfer, Credit, InterpreterParams};
use crate::types::{sort_addresses, AppIdentity};
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::BTreeMap;

pub const FREE_BALANCE_STATE_ENCODING: &str =
    "tuple(address[] tokenAddresses, tuple(address to, uint256 amount)[][] balances, bytes32[] activeApps)";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FreeBalanceState {
    pub balances: BTreeMap<Address, BTreeMap<Address, U256>>,
    pub active_apps: Vec<H256>,
}

impl FreeBalanceState {
    pub fn new(owners: &[Address], assets: &[Address]) -> Self {
        let balances = assets
            .iter()
            .map(|asset| (*asset, owners.iter().map(|o| (*o, U256::zero())).collect()))
            .collect();
        Self { balances, active_apps: Vec::new() }
    }

    pub fn balance_of(&self, token: &Address, owner: &Address) -> U256 {
        self.balances
            .get(token)
            .and_then(|row| row.get(owner))
            .copied()
            .unwrap_or_default()
    }

    pub fn debit(&mut self, token: Address, owner: Address, amount: U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let available = self.balance_of(&token, &owner);
        if available < amount {
            return Err(EngineError::Validation(format!(
                "insufficient free balance for {:?} in {:?}: has {}, needs {}",
                owner, token, available, amount
            )));
        }
        self.balances.entry(token).or_default().insert(owner, available - amount);
        Ok(())
    }

    pub fn credit(&mut self, token: Address, owner: Address, amount: U256) -> Result<()> {
        let current = self.balance_of(&token, &owner);
        let next = current
            .checked_add(amount)
            .ok_or_else(|| EngineError::Validation("free balance overflow".into()))?;
        self.balances.entry(token).or_default().insert(owner, next);
        Ok(())
    }

    pub fn apply_credits(&mut self, credits: &[Credit]) -> Result<()> {
        for credit in credits {
            self.credit(credit.token, credit.to, credit.amount)?;
        }
        Ok(())
    }

    pub fn activate(&mut self, app: H256) -> Result<()> {
        if self.active_apps.contains(&app) {
            return Err(EngineError::Validation(format!("app {:?} already active", app)));
        }
        self.active_apps.push(app);
        Ok(())
    }

    pub fn deactivate(&mut self, app: H256) -> Result<()> {
        let before = self.active_apps.len();
        self.active_apps.retain(|a| *a != app);
        if self.active_apps.len() == before {
            return Err(EngineError::Validation(format!("app {:?} is not active", app)));
        }
        Ok(())
    }

    pub fn encode(&self) -> Bytes {
        let tokens = Token::Array(self.balances.keys().map(|t| Token::Address(*t)).collect());
        let balances = Token::Array(
            self.balances
                .values()
                .map(|row| {
                    Token::Array(
                        row.iter()
                            .map(|(to, amount)| CoinTransfer::new(*to, *amount).to_token())
                            .collect(),
                    )
                })
                .collect(),
        );
        let active = Token::Array(
            self.active_apps
                .iter()
                .map(|a| Token::FixedBytes(a.as_bytes().to_vec()))
                .collect(),
        );
        encode(&[Token::Tuple(vec![tokens, balances, active])]).into()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let param = ParamType::Tuple(vec![
            ParamType::Array(Box::new(ParamType::Address)),
            ParamType::Array(Box::new(ParamType::Array(Box::new(CoinTransfer::param_type())))),
            ParamType::Array(Box::new(ParamType::FixedBytes(32))),
        ]);
        let fields = match decode(&[param], bytes)?.into_iter().next() {
            Some(Token::Tuple(fields)) if fields.len() == 3 => fields,
            _ => return Err(EngineError::Abi("malformed free balance state".into())),
        };
        let mut fields = fields.into_iter();
        let (tokens, rows, active) = match (fields.next(), fields.next(), fields.next()) {
            (Some(Token::Array(t)), Some(Token::Array(r)), Some(Token::Array(a))) => (t, r, a),
            _ => return Err(EngineError::Abi("malformed free balance state".into())),
        };
        if tokens.len() != rows.len() {
            return Err(EngineError::Abi("free balance token/balance length mismatch".into()));
        }
        let mut balances = BTreeMap::new();
        for (token, row) in tokens.into_iter().zip(rows) {
            let token = token
                .into_address()
                .ok_or_else(|| EngineError::Abi("free balance token is not an address".into()))?;
            let transfers = match row {
                Token::Array(items) => items
                    .into_iter()
                    .map(CoinTransfer::from_token)
                    .collect::<Result<Vec<_>>>()?,
                _ => return Err(EngineError::Abi("free balance row is not an array".into())),
            };
            balances.insert(token, transfers.into_iter().map(|t| (t.to, t.amount)).collect());
        }
        let active_apps = active
            .into_iter()
            .map(|t| match t {
                Token::FixedBytes(b) if b.len() == 32 => Ok(H256::from_slice(&b)),
                _ => Err(EngineError::Abi("active app is not bytes32".into())),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { balances, active_apps })
    }
}

/// Builds the free balance instance a fresh channel starts with.
pub fn create_free_balance(
    multisig_address: Address,
    initiator: Address,
    responder: Address,
    identity_app: Address,
    timeout: U256,
    assets: &[Address],
) -> AppInstance {
    let owners = sort_addresses(vec![initiator, responder]);
    let state = FreeBalanceState::new(&owners, assets);
    let identity = AppIdentity {
        multisig_address,
        channel_nonce: U256::zero(),
        participants: owners,
        app_definition: identity_app,
        default_timeout: timeout,
    };
    AppInstance {
        identity_hash: identity.identity_hash(),
        multisig_address,
        initiator_identifier: initiator,
        responder_identifier: responder,
        app_interface: AppInterface {
            addr: identity_app,
            state_encoding: FREE_BALANCE_STATE_ENCODING.to_string(),
            action_encoding: None,
        },
        default_timeout: timeout,
        state_timeout: U256::zero(),
        latest_state: state.encode(),
        latest_version_number: 0,
        app_seq_no: 0,
        interpreter_params: InterpreterParams::MultiAssetMultiPartyCoinTransfer {
            limit: Vec::new(),
            token_addresses: Vec::new(),
        },
        initiator_deposit: U256::zero(),
        initiator_deposit_asset_id: Address::zero(),
        responder_deposit: U256::zero(),
        responder_deposit_asset_id: Address::zero(),
        meta: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    #[test]
    fn state_survives_abi_encoding() {
        let mut state = FreeBalanceState::new(&[addr(1), addr(2)], &[Address::zero(), addr(9)]);
        state.credit(addr(9), addr(2), U256::from(42)).unwrap();
        state.activate(H256::repeat_byte(5)).unwrap();
        let decoded = FreeBalanceState::decode(&state.encode()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn debit_requires_funds() {
        let mut state = FreeBalanceState::new(&[addr(1), addr(2)], &[Address::zero()]);
        state.credit(Address::zero(), addr(1), U256::from(10)).unwrap();
        assert!(state.debit(Address::zero(), addr(1), U256::from(11)).is_err());
        state.debit(Address::zero(), addr(1), U256::from(10)).unwrap();
        assert!(state.balance_of(&Address::zero(), &addr(1)).is_zero());
    }

    #[test]
    fn apps_activate_once() {
        let mut state = FreeBalanceState::default();
        let app = H256::repeat_byte(1);
        state.activate(app).unwrap();
        assert!(state.activate(app).is_err());
        state.deactivate(app).unwrap();
        assert!(state.deactivate(app).is_err());
    }

    #[test]
    fn free_balance_uses_sequence_zero() {
        let fb = create_free_balance(addr(3), addr(2), addr(1), addr(4), U256::from(10), &[Address::zero()]);
        assert_eq!(fb.app_seq_no, 0);
        assert_eq!(fb.latest_version_number, 0);
        assert_eq!(fb.participants(), vec![addr(1), addr(2)]);
        assert_eq!(fb.identity().identity_hash(), fb.identity_hash);
    }
}
