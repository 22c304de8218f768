//! Calldata builders and log decoders for the multisig and challenge registry
//! contracts.

use crate::error::{EngineError, Result};
use crate::types::AppIdentity;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, Log, Signature, H256, U256};
use ethers::utils::{id, keccak256};

pub const EXEC_TRANSACTION: &str = "execTransaction(address,uint256,bytes,uint8,bytes[])";
pub const EXECUTE_EFFECT_OF_FREE_BALANCE: &str = "executeEffectOfFreeBalance(address,bytes32,address)";
pub const EXECUTE_EFFECT_OF_INTERPRETED_APP_OUTCOME: &str =
    "executeEffectOfInterpretedAppOutcome(address,bytes32,bytes32,address,bytes)";
pub const ERC20_TRANSFER: &str = "transfer(address,uint256)";

pub const SET_STATE: &str = "setState((address,uint256,address[],address,uint256),(bytes32,uint256,uint256,bytes[]))";
pub const SET_OUTCOME: &str = "setOutcome((address,uint256,address[],address,uint256),bytes)";
pub const APP_CHALLENGES: &str = "appChallenges(bytes32)";

pub const CHALLENGE_UPDATED_EVENT: &str = "ChallengeUpdated(bytes32,uint8,bytes32,uint256,uint256)";
pub const STATE_PROGRESSED_EVENT: &str = "StateProgressed(bytes32,bytes,uint256,uint256,address,bytes)";

pub fn call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(encode(args));
    data.into()
}

pub fn event_topic(signature: &str) -> H256 {
    H256(keccak256(signature))
}

pub fn signature_tokens(signatures: &[Signature]) -> Token {
    Token::Array(signatures.iter().map(|s| Token::Bytes(s.to_vec())).collect())
}

pub fn signed_update_token(app_state_hash: H256, version_number: u64, timeout: U256, signatures: &[Signature]) -> Token {
    Token::Tuple(vec![
        Token::FixedBytes(app_state_hash.as_bytes().to_vec()),
        Token::Uint(U256::from(version_number)),
        Token::Uint(timeout),
        signature_tokens(signatures),
    ])
}

pub fn exec_transaction(to: Address, value: U256, data: &Bytes, operation: u8, signatures: &[Signature]) -> Bytes {
    call(
        EXEC_TRANSACTION,
        &[
            Token::Address(to),
            Token::Uint(value),
            Token::Bytes(data.to_vec()),
            Token::Uint(U256::from(operation)),
            signature_tokens(signatures),
        ],
    )
}

pub fn set_state(identity: &AppIdentity, app_state_hash: H256, version: u64, timeout: U256, sigs: &[Signature]) -> Bytes {
    call(SET_STATE, &[identity.to_token(), signed_update_token(app_state_hash, version, timeout, sigs)])
}

pub fn set_outcome(identity: &AppIdentity, final_state: &Bytes) -> Bytes {
    call(SET_OUTCOME, &[identity.to_token(), Token::Bytes(final_state.to_vec())])
}

pub fn app_challenges(identity_hash: H256) -> Bytes {
    call(APP_CHALLENGES, &[Token::FixedBytes(identity_hash.as_bytes().to_vec())])
}

/// Challenge record as the registry stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnchainChallenge {
    pub status: u8,
    pub app_state_hash: H256,
    pub version_number: u64,
    pub finalizes_at: u64,
}

pub fn decode_app_challenge(data: &[u8]) -> Result<OnchainChallenge> {
    let tokens = decode(
        &[ParamType::Uint(8), ParamType::FixedBytes(32), ParamType::Uint(256), ParamType::Uint(256)],
        data,
    )?;
    match tokens.as_slice() {
        [Token::Uint(status), Token::FixedBytes(hash), Token::Uint(version), Token::Uint(finalizes_at)] => {
            Ok(OnchainChallenge {
                status: status.low_u32() as u8,
                app_state_hash: H256::from_slice(hash),
                version_number: version.low_u64(),
                finalizes_at: finalizes_at.low_u64(),
            })
        }
        _ => Err(EngineError::Abi("malformed appChallenges result".into())),
    }
}

/// `ChallengeUpdated(bytes32 identityHash, uint8 status, bytes32 appStateHash, uint256 versionNumber, uint256 finalizesAt)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeUpdatedLog {
    pub identity_hash: H256,
    pub challenge: OnchainChallenge,
}

/// `StateProgressed(bytes32 identityHash, bytes action, uint256 versionNumber, uint256 timeout, address turnTaker, bytes signature)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateProgressedLog {
    pub identity_hash: H256,
    pub action: Bytes,
    pub version_number: u64,
    pub timeout: U256,
    pub turn_taker: Address,
    pub signature: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryLog {
    ChallengeUpdated(ChallengeUpdatedLog),
    StateProgressed(StateProgressedLog),
}

/// Decodes a challenge registry log, `None` for logs of other events.
pub fn decode_registry_log(log: &Log) -> Result<Option<RegistryLog>> {
    let topic = match log.topics.first() {
        Some(topic) => *topic,
        None => return Ok(None),
    };
    if topic == event_topic(CHALLENGE_UPDATED_EVENT) {
        let tokens = decode(
            &[
                ParamType::FixedBytes(32),
                ParamType::Uint(8),
                ParamType::FixedBytes(32),
                ParamType::Uint(256),
                ParamType::Uint(256),
            ],
            &log.data,
        )?;
        return match tokens.as_slice() {
            [Token::FixedBytes(id), Token::Uint(status), Token::FixedBytes(hash), Token::Uint(version), Token::Uint(at)] => {
                Ok(Some(RegistryLog::ChallengeUpdated(ChallengeUpdatedLog {
                    identity_hash: H256::from_slice(id),
                    challenge: OnchainChallenge {
                        status: status.low_u32() as u8,
                        app_state_hash: H256::from_slice(hash),
                        version_number: version.low_u64(),
                        finalizes_at: at.low_u64(),
                    },
                })))
            }
            _ => Err(EngineError::Abi("malformed ChallengeUpdated log".into())),
        };
    }
    if topic == event_topic(STATE_PROGRESSED_EVENT) {
        let tokens = decode(
            &[
                ParamType::FixedBytes(32),
                ParamType::Bytes,
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Address,
                ParamType::Bytes,
            ],
            &log.data,
        )?;
        return match tokens.as_slice() {
            [Token::FixedBytes(id), Token::Bytes(action), Token::Uint(version), Token::Uint(timeout), Token::Address(turn_taker), Token::Bytes(sig)] => {
                Ok(Some(RegistryLog::StateProgressed(StateProgressedLog {
                    identity_hash: H256::from_slice(id),
                    action: action.clone().into(),
                    version_number: version.low_u64(),
                    timeout: *timeout,
                    turn_taker: *turn_taker,
                    signature: sig.clone().into(),
                })))
            }
            _ => Err(EngineError::Abi("malformed StateProgressed log".into())),
        };
    }
    Ok(None)
}

/// Builds the raw log a registry would emit, used by the mock chain.
pub fn encode_challenge_updated(update: &ChallengeUpdatedLog) -> (Vec<H256>, Bytes) {
    let data = encode(&[
        Token::FixedBytes(update.identity_hash.as_bytes().to_vec()),
        Token::Uint(U256::from(update.challenge.status)),
        Token::FixedBytes(update.challenge.app_state_hash.as_bytes().to_vec()),
        Token::Uint(U256::from(update.challenge.version_number)),
        Token::Uint(U256::from(update.challenge.finalizes_at)),
    ]);
    (vec![event_topic(CHALLENGE_UPDATED_EVENT), update.identity_hash], data.into())
}

pub fn encode_state_progressed(progressed: &StateProgressedLog) -> (Vec<H256>, Bytes) {
    let data = encode(&[
        Token::FixedBytes(progressed.identity_hash.as_bytes().to_vec()),
        Token::Bytes(progressed.action.to_vec()),
        Token::Uint(U256::from(progressed.version_number)),
        Token::Uint(progressed.timeout),
        Token::Address(progressed.turn_taker),
        Token::Bytes(progressed.signature.to_vec()),
    ]);
    (vec![event_topic(STATE_PROGRESSED_EVENT), progressed.identity_hash], data.into())
}

/// Selector of a call, used to recognise submitted transactions.
pub fn selector_of(data: &[u8]) -> Option<[u8; 4]> {
    data.get(..4).map(|s| [s[0], s[1], s[2], s[3]])
}
