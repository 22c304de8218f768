use crate::outcome::OutcomeType;
use crate::types::ProtocolName;
use ethers::types::{Address, Bytes, Signature, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetupParams {
    pub multisig_address: Address,
    pub initiator_identifier: Address,
    pub responder_identifier: Address,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProposeParams {
    pub multisig_address: Address,
    pub initiator_identifier: Address,
    pub responder_identifier: Address,
    pub app_definition: Address,
    pub state_encoding: String,
    pub action_encoding: Option<String>,
    pub initiator_deposit: U256,
    pub initiator_deposit_asset_id: Address,
    pub responder_deposit: U256,
    pub responder_deposit_asset_id: Address,
    pub default_timeout: U256,
    pub state_timeout: U256,
    pub initial_state: Bytes,
    pub outcome_type: OutcomeType,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallParams {
    pub multisig_address: Address,
    pub initiator_identifier: Address,
    pub responder_identifier: Address,
    pub proposal_identity_hash: H256,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UninstallParams {
    pub multisig_address: Address,
    pub initiator_identifier: Address,
    pub responder_identifier: Address,
    pub app_identity_hash: H256,
    /// Final action applied to the app before its outcome is computed.
    #[serde(default)]
    pub action: Option<Bytes>,
    /// The initiator's local version of the app, filled in by the initiator.
    #[serde(default)]
    pub version_number: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TakeActionParams {
    pub multisig_address: Address,
    pub initiator_identifier: Address,
    pub responder_identifier: Address,
    pub app_identity_hash: H256,
    pub action: Bytes,
    /// Defaults to the app's default timeout.
    #[serde(default)]
    pub state_timeout: Option<U256>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolParams {
    Setup(SetupParams),
    Propose(ProposeParams),
    Install(InstallParams),
    Uninstall(UninstallParams),
    TakeAction(TakeActionParams),
}

impl ProtocolParams {
    pub fn protocol(&self) -> ProtocolName {
        match self {
            ProtocolParams::Setup(_) => ProtocolName::Setup,
            ProtocolParams::Propose(_) => ProtocolName::Propose,
            ProtocolParams::Install(_) => ProtocolName::Install,
            ProtocolParams::Uninstall(_) => ProtocolName::Uninstall,
            ProtocolParams::TakeAction(_) => ProtocolName::TakeAction,
        }
    }

    pub fn multisig_address(&self) -> Address {
        match self {
            ProtocolParams::Setup(p) => p.multisig_address,
            ProtocolParams::Propose(p) => p.multisig_address,
            ProtocolParams::Install(p) => p.multisig_address,
            ProtocolParams::Uninstall(p) => p.multisig_address,
            ProtocolParams::TakeAction(p) => p.multisig_address,
        }
    }

    pub fn initiator(&self) -> Address {
        match self {
            ProtocolParams::Setup(p) => p.initiator_identifier,
            ProtocolParams::Propose(p) => p.initiator_identifier,
            ProtocolParams::Install(p) => p.initiator_identifier,
            ProtocolParams::Uninstall(p) => p.initiator_identifier,
            ProtocolParams::TakeAction(p) => p.initiator_identifier,
        }
    }

    pub fn responder(&self) -> Address {
        match self {
            ProtocolParams::Setup(p) => p.responder_identifier,
            ProtocolParams::Propose(p) => p.responder_identifier,
            ProtocolParams::Install(p) => p.responder_identifier,
            ProtocolParams::Uninstall(p) => p.responder_identifier,
            ProtocolParams::TakeAction(p) => p.responder_identifier,
        }
    }
}

/// One step of a protocol run. `signatures` are the sender's own, in the order
/// the step defines.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub process_id: Uuid,
    pub protocol: ProtocolName,
    pub seq: u8,
    pub from: Address,
    pub to: Address,
    pub params: ProtocolParams,
    pub signatures: Vec<Signature>,
}

impl ProtocolMessage {
    pub fn new(process_id: Uuid, seq: u8, from: Address, to: Address, params: ProtocolParams) -> Self {
        Self { process_id, protocol: params.protocol(), seq, from, to, params, signatures: Vec::new() }
    }

    pub fn with_signatures(mut self, signatures: Vec<Signature>) -> Self {
        self.signatures = signatures;
        self
    }

    /// Message for the next step of the same run, addressed back to the sender.
    pub fn reply(&self, signatures: Vec<Signature>) -> Self {
        Self {
            process_id: self.process_id,
            protocol: self.protocol,
            seq: self.seq + 1,
            from: self.to,
            to: self.from,
            params: self.params.clone(),
            signatures,
        }
    }
}
