use crate::outcome::{InterpreterParams, OutcomeType};
use crate::types::{hash_bytes, sort_addresses, AppIdentity};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppInterface {
    /// On-chain address of the app's outcome logic.
    pub addr: Address,
    pub state_encoding: String,
    pub action_encoding: Option<String>,
}

/// An app both parties agreed to consider installing. Nothing is bound into the
/// multisig yet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppProposal {
    pub identity_hash: H256,
    pub multisig_address: Address,
    pub initiator_identifier: Address,
    pub responder_identifier: Address,
    pub app_interface: AppInterface,
    pub default_timeout: U256,
    pub state_timeout: U256,
    pub initial_state: Bytes,
    pub app_seq_no: u64,
    pub interpreter_params: InterpreterParams,
    pub initiator_deposit: U256,
    pub initiator_deposit_asset_id: Address,
    pub responder_deposit: U256,
    pub responder_deposit_asset_id: Address,
    pub meta: Option<serde_json::Value>,
}

impl AppProposal {
    pub fn participants(&self) -> Vec<Address> {
        sort_addresses(vec![self.initiator_identifier, self.responder_identifier])
    }

    pub fn identity(&self) -> AppIdentity {
        AppIdentity {
            multisig_address: self.multisig_address,
            channel_nonce: U256::from(self.app_seq_no),
            participants: self.participants(),
            app_definition: self.app_interface.addr,
            default_timeout: self.default_timeout,
        }
    }

    pub fn outcome_type(&self) -> OutcomeType {
        self.interpreter_params.outcome_type()
    }

    /// The instance installed from this proposal, at version one with the
    /// proposed initial state.
    pub fn to_app_instance(&self) -> AppInstance {
        AppInstance {
            identity_hash: self.identity_hash,
            multisig_address: self.multisig_address,
            initiator_identifier: self.initiator_identifier,
            responder_identifier: self.responder_identifier,
            app_interface: self.app_interface.clone(),
            default_timeout: self.default_timeout,
            state_timeout: self.state_timeout,
            latest_state: self.initial_state.clone(),
            latest_version_number: 1,
            app_seq_no: self.app_seq_no,
            interpreter_params: self.interpreter_params.clone(),
            initiator_deposit: self.initiator_deposit,
            initiator_deposit_asset_id: self.initiator_deposit_asset_id,
            responder_deposit: self.responder_deposit,
            responder_deposit_asset_id: self.responder_deposit_asset_id,
            meta: self.meta.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppInstance {
    pub identity_hash: H256,
    pub multisig_address: Address,
    pub initiator_identifier: Address,
    pub responder_identifier: Address,
    pub app_interface: AppInterface,
    pub default_timeout: U256,
    /// Timeout the latest state was signed with.
    pub state_timeout: U256,
    pub latest_state: Bytes,
    pub latest_version_number: u64,
    pub app_seq_no: u64,
    pub interpreter_params: InterpreterParams,
    pub initiator_deposit: U256,
    pub initiator_deposit_asset_id: Address,
    pub responder_deposit: U256,
    pub responder_deposit_asset_id: Address,
    pub meta: Option<serde_json::Value>,
}

impl AppInstance {
    pub fn participants(&self) -> Vec<Address> {
        sort_addresses(vec![self.initiator_identifier, self.responder_identifier])
    }

    pub fn identity(&self) -> AppIdentity {
        AppIdentity {
            multisig_address: self.multisig_address,
            channel_nonce: U256::from(self.app_seq_no),
            participants: self.participants(),
            app_definition: self.app_interface.addr,
            default_timeout: self.default_timeout,
        }
    }

    pub fn outcome_type(&self) -> OutcomeType {
        self.interpreter_params.outcome_type()
    }

    pub fn state_hash(&self) -> H256 {
        hash_bytes(&self.latest_state)
    }

    pub fn latest_timeout(&self) -> U256 {
        self.state_timeout
    }

    /// The next version of this app with `state` as its latest state.
    pub fn set_state(&self, state: Bytes, timeout: U256) -> AppInstance {
        AppInstance {
            latest_state: state,
            latest_version_number: self.latest_version_number + 1,
            state_timeout: timeout,
            ..self.clone()
        }
    }

    pub fn is_participant(&self, address: &Address) -> bool {
        *address == self.initiator_identifier || *address == self.responder_identifier
    }
}
