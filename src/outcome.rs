use crate::error::{EngineError, Result};
use crate::types::NetworkContext;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinTransfer {
    pub to: Address,
    pub amount: U256,
}

impl CoinTransfer {
    pub fn new(to: Address, amount: U256) -> Self {
        Self { to, amount }
    }

    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![Token::Address(self.to), Token::Uint(self.amount)])
    }

    pub fn param_type() -> ParamType {
        ParamType::Tuple(vec![ParamType::Address, ParamType::Uint(256)])
    }

    pub fn from_token(token: Token) -> Result<Self> {
        match token {
            Token::Tuple(fields) => match fields.as_slice() {
                [Token::Address(to), Token::Uint(amount)] => Ok(Self { to: *to, amount: *amount }),
                _ => Err(EngineError::Abi("malformed coin transfer".into())),
            },
            _ => Err(EngineError::Abi("coin transfer is not a tuple".into())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeType {
    TwoPartyFixedOutcome,
    SingleAssetTwoPartyCoinTransfer,
    MultiAssetMultiPartyCoinTransfer,
}

/// Decoded outcome of a `TwoPartyFixedOutcome` app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TwoPartyFixedOutcome {
    SendToAddrOne = 0,
    SendToAddrTwo = 1,
    SplitAndSendToBothAddrs = 2,
}

/// Parameters handed to the on-chain interpreter of an app's outcome.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "outcomeType", rename_all_fields = "camelCase")]
pub enum InterpreterParams {
    TwoPartyFixedOutcome {
        player_addrs: [Address; 2],
        amount: U256,
        token_address: Address,
    },
    SingleAssetTwoPartyCoinTransfer {
        limit: U256,
        token_address: Address,
    },
    MultiAssetMultiPartyCoinTransfer {
        limit: Vec<U256>,
        token_addresses: Vec<Address>,
    },
}

/// Amount credited to `to` in `token` when an app is uninstalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    pub token: Address,
    pub to: Address,
    pub amount: U256,
}

impl InterpreterParams {
    /// Derives the interpreter parameters that bound an app's payout to its deposits.
    pub fn for_deposits(
        outcome_type: OutcomeType,
        initiator: Address,
        responder: Address,
        initiator_deposit: (Address, U256),
        responder_deposit: (Address, U256),
    ) -> Result<Self> {
        let (initiator_asset, initiator_amount) = initiator_deposit;
        let (responder_asset, responder_amount) = responder_deposit;
        match outcome_type {
            OutcomeType::TwoPartyFixedOutcome | OutcomeType::SingleAssetTwoPartyCoinTransfer => {
                if initiator_asset != responder_asset {
                    return Err(EngineError::Validation(format!(
                        "{:?} apps require a single deposit asset, got {:?} and {:?}",
                        outcome_type, initiator_asset, responder_asset
                    )));
                }
                let total = initiator_amount
                    .checked_add(responder_amount)
                    .ok_or_else(|| EngineError::Validation("deposit overflow".into()))?;
                Ok(match outcome_type {
                    OutcomeType::TwoPartyFixedOutcome => InterpreterParams::TwoPartyFixedOutcome {
                        player_addrs: [initiator, responder],
                        amount: total,
                        token_address: initiator_asset,
                    },
                    _ => InterpreterParams::SingleAssetTwoPartyCoinTransfer { limit: total, token_address: initiator_asset },
                })
            }
            OutcomeType::MultiAssetMultiPartyCoinTransfer => {
                let mut limits: BTreeMap<Address, U256> = BTreeMap::new();
                for (asset, amount) in [initiator_deposit, responder_deposit] {
                    let entry = limits.entry(asset).or_default();
                    *entry = entry
                        .checked_add(amount)
                        .ok_or_else(|| EngineError::Validation("deposit overflow".into()))?;
                }
                Ok(InterpreterParams::MultiAssetMultiPartyCoinTransfer {
                    token_addresses: limits.keys().copied().collect(),
                    limit: limits.values().copied().collect(),
                })
            }
        }
    }

    pub fn outcome_type(&self) -> OutcomeType {
        match self {
            InterpreterParams::TwoPartyFixedOutcome { .. } => OutcomeType::TwoPartyFixedOutcome,
            InterpreterParams::SingleAssetTwoPartyCoinTransfer { .. } => OutcomeType::SingleAssetTwoPartyCoinTransfer,
            InterpreterParams::MultiAssetMultiPartyCoinTransfer { .. } => OutcomeType::MultiAssetMultiPartyCoinTransfer,
        }
    }

    pub fn interpreter_address(&self, network: &NetworkContext) -> Address {
        match self {
            InterpreterParams::TwoPartyFixedOutcome { .. } => network.two_party_fixed_outcome_interpreter,
            InterpreterParams::SingleAssetTwoPartyCoinTransfer { .. } => {
                network.single_asset_two_party_coin_transfer_interpreter
            }
            InterpreterParams::MultiAssetMultiPartyCoinTransfer { .. } => {
                network.multi_asset_multi_party_coin_transfer_interpreter
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let token = match self {
            InterpreterParams::TwoPartyFixedOutcome { player_addrs, amount, token_address } => Token::Tuple(vec![
                Token::FixedArray(player_addrs.iter().map(|a| Token::Address(*a)).collect()),
                Token::Uint(*amount),
                Token::Address(*token_address),
            ]),
            InterpreterParams::SingleAssetTwoPartyCoinTransfer { limit, token_address } => {
                Token::Tuple(vec![Token::Uint(*limit), Token::Address(*token_address)])
            }
            InterpreterParams::MultiAssetMultiPartyCoinTransfer { limit, token_addresses } => Token::Tuple(vec![
                Token::Array(limit.iter().map(|l| Token::Uint(*l)).collect()),
                Token::Array(token_addresses.iter().map(|a| Token::Address(*a)).collect()),
            ]),
        };
        encode(&[token]).into()
    }

    /// Decodes an ABI encoded app outcome into free balance credits, refusing
    /// outcomes that pay out more than the interpreter would.
    pub fn credits(&self, outcome: &[u8]) -> Result<Vec<Credit>> {
        match self {
            InterpreterParams::TwoPartyFixedOutcome { player_addrs, amount, token_address } => {
                let tokens = decode(&[ParamType::Uint(8)], outcome)?;
                let choice = match tokens.into_iter().next() {
                    Some(Token::Uint(v)) if v <= U256::from(2u8) => v.as_u32() as u8,
                    _ => return Err(EngineError::Abi("invalid two party fixed outcome".into())),
                };
                let credit = |to: Address, amount: U256| Credit { token: *token_address, to, amount };
                Ok(match choice {
                    c if c == TwoPartyFixedOutcome::SendToAddrOne as u8 => vec![credit(player_addrs[0], *amount)],
                    c if c == TwoPartyFixedOutcome::SendToAddrTwo as u8 => vec![credit(player_addrs[1], *amount)],
                    _ => {
                        let half = *amount / 2;
                        vec![credit(player_addrs[0], half), credit(player_addrs[1], *amount - half)]
                    }
                })
            }
            InterpreterParams::SingleAssetTwoPartyCoinTransfer { limit, token_address } => {
                let transfers = decode_coin_transfer_pair(outcome)?;
                let total = sum(transfers.iter().map(|t| t.amount))?;
                if total > *limit {
                    return Err(EngineError::Validation(format!("outcome pays {} above limit {}", total, limit)));
                }
                Ok(transfers
                    .into_iter()
                    .map(|t| Credit { token: *token_address, to: t.to, amount: t.amount })
                    .collect())
            }
            InterpreterParams::MultiAssetMultiPartyCoinTransfer { limit, token_addresses } => {
                let rows = decode_coin_transfer_matrix(outcome)?;
                if rows.len() != token_addresses.len() {
                    return Err(EngineError::Validation(format!(
                        "outcome has {} assets, interpreter expects {}",
                        rows.len(),
                        token_addresses.len()
                    )));
                }
                let mut credits = Vec::new();
                for ((row, token), limit) in rows.into_iter().zip(token_addresses).zip(limit) {
                    let total = sum(row.iter().map(|t| t.amount))?;
                    if total > *limit {
                        return Err(EngineError::Validation(format!(
                            "outcome pays {} of {:?} above limit {}",
                            total, token, limit
                        )));
                    }
                    credits.extend(row.into_iter().map(|t| Credit { token: *token, to: t.to, amount: t.amount }));
                }
                Ok(credits)
            }
        }
    }
}

fn sum(mut amounts: impl Iterator<Item = U256>) -> Result<U256> {
    amounts.try_fold(U256::zero(), |acc, a| {
        acc.checked_add(a).ok_or_else(|| EngineError::Validation("outcome amount overflow".into()))
    })
}

pub fn encode_coin_transfer_pair(transfers: &[CoinTransfer; 2]) -> Bytes {
    encode(&[Token::FixedArray(transfers.iter().map(CoinTransfer::to_token).collect())]).into()
}

pub fn decode_coin_transfer_pair(bytes: &[u8]) -> Result<[CoinTransfer; 2]> {
    let tokens = decode(&[ParamType::FixedArray(Box::new(CoinTransfer::param_type()), 2)], bytes)?;
    match tokens.into_iter().next() {
        Some(Token::FixedArray(items)) if items.len() == 2 => {
            let mut items = items.into_iter();
            let first = items.next().map(CoinTransfer::from_token).transpose()?;
            let second = items.next().map(CoinTransfer::from_token).transpose()?;
            match (first, second) {
                (Some(a), Some(b)) => Ok([a, b]),
                _ => Err(EngineError::Abi("expected two coin transfers".into())),
            }
        }
        _ => Err(EngineError::Abi("expected two coin transfers".into())),
    }
}

pub fn encode_coin_transfer_matrix(rows: &[Vec<CoinTransfer>]) -> Bytes {
    let rows = rows
        .iter()
        .map(|row| Token::Array(row.iter().map(CoinTransfer::to_token).collect()))
        .collect();
    encode(&[Token::Array(rows)]).into()
}

pub fn decode_coin_transfer_matrix(bytes: &[u8]) -> Result<Vec<Vec<CoinTransfer>>> {
    let param = ParamType::Array(Box::new(ParamType::Array(Box::new(CoinTransfer::param_type()))));
    match decode(&[param], bytes)?.into_iter().next() {
        Some(Token::Array(rows)) => rows
            .into_iter()
            .map(|row| match row {
                Token::Array(items) => items.into_iter().map(CoinTransfer::from_token).collect(),
                _ => Err(EngineError::Abi("coin transfer row is not an array".into())),
            })
            .collect(),
        _ => Err(EngineError::Abi("expected coin transfer matrix".into())),
    }
}
