use crate::app_instance::{AppInstance, AppProposal};
use crate::error::{EngineError, Result};
use crate::free_balance::{create_free_balance, FreeBalanceState};
use crate::outcome::Credit;
use crate::types::{sort_addresses, ContractAddresses};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const STATE_CHANNEL_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateChannel {
    pub multisig_address: Address,
    pub addresses: ContractAddresses,
    /// Setup initiator first.
    pub user_identifiers: [Address; 2],
    pub proposed_app_instances: BTreeMap<H256, AppProposal>,
    pub app_instances: BTreeMap<H256, AppInstance>,
    pub free_balance: AppInstance,
    pub monotonic_num_proposed_apps: u64,
    pub chain_id: u64,
    pub schema_version: u32,
}

impl StateChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn setup(
        multisig_address: Address,
        addresses: ContractAddresses,
        initiator: Address,
        responder: Address,
        identity_app: Address,
        free_balance_timeout: U256,
        assets: &[Address],
        chain_id: u64,
    ) -> Result<Self> {
        if initiator == responder {
            return Err(EngineError::Validation("channel owners must differ".into()));
        }
        let free_balance =
            create_free_balance(multisig_address, initiator, responder, identity_app, free_balance_timeout, assets);
        Ok(Self {
            multisig_address,
            addresses,
            user_identifiers: [initiator, responder],
            proposed_app_instances: BTreeMap::new(),
            app_instances: BTreeMap::new(),
            free_balance,
            monotonic_num_proposed_apps: 0,
            chain_id,
            schema_version: STATE_CHANNEL_SCHEMA_VERSION,
        })
    }

    /// Owners in canonical (ascending) order.
    pub fn multisig_owners(&self) -> Vec<Address> {
        sort_addresses(self.user_identifiers.to_vec())
    }

    pub fn is_owner(&self, address: &Address) -> bool {
        self.user_identifiers.contains(address)
    }

    pub fn counterparty_of(&self, me: &Address) -> Result<Address> {
        match self.user_identifiers {
            [a, b] if a == *me => Ok(b),
            [a, b] if b == *me => Ok(a),
            _ => Err(EngineError::Validation(format!(
                "{:?} is not an owner of channel {:?}",
                me, self.multisig_address
            ))),
        }
    }

    pub fn free_balance_state(&self) -> Result<FreeBalanceState> {
        FreeBalanceState::decode(&self.free_balance.latest_state)
    }

    pub fn get_app_instance(&self, identity_hash: &H256) -> Result<&AppInstance> {
        self.app_instances
            .get(identity_hash)
            .ok_or_else(|| EngineError::not_found("app instance", identity_hash))
    }

    pub fn get_proposal(&self, identity_hash: &H256) -> Result<&AppProposal> {
        self.proposed_app_instances
            .get(identity_hash)
            .ok_or_else(|| EngineError::not_found("app proposal", identity_hash))
    }

    /// Sequence number the next proposal gets. Free balance owns zero.
    pub fn next_app_seq_no(&self) -> u64 {
        self.monotonic_num_proposed_apps + 1
    }

    pub fn add_proposal(&self, proposal: AppProposal) -> Result<Self> {
        if proposal.app_seq_no != self.next_app_seq_no() {
            return Err(EngineError::Validation(format!(
                "proposal sequence number {} does not follow {}",
                proposal.app_seq_no, self.monotonic_num_proposed_apps
            )));
        }
        if self.proposed_app_instances.contains_key(&proposal.identity_hash)
            || self.app_instances.contains_key(&proposal.identity_hash)
        {
            return Err(EngineError::Validation(format!(
                "identity hash {:?} already used",
                proposal.identity_hash
            )));
        }
        let mut next = self.clone();
        next.monotonic_num_proposed_apps += 1;
        next.proposed_app_instances.insert(proposal.identity_hash, proposal);
        Ok(next)
    }

    /// Moves a proposal into the installed set, funding it from the free balance.
    pub fn install_app(&self, app: AppInstance, free_balance_timeout: U256) -> Result<Self> {
        if !self.proposed_app_instances.contains_key(&app.identity_hash) {
            return Err(EngineError::not_found("app proposal", app.identity_hash));
        }
        let mut balances = self.free_balance_state()?;
        balances.debit(app.initiator_deposit_asset_id, app.initiator_identifier, app.initiator_deposit)?;
        balances.debit(app.responder_deposit_asset_id, app.responder_identifier, app.responder_deposit)?;
        balances.activate(app.identity_hash)?;

        let mut next = self.clone();
        next.proposed_app_instances.remove(&app.identity_hash);
        next.free_balance = self.free_balance.set_state(balances.encode(), free_balance_timeout);
        next.app_instances.insert(app.identity_hash, app);
        Ok(next)
    }

    /// Removes an installed app, crediting its outcome back to the free balance.
    pub fn uninstall_app(&self, identity_hash: &H256, credits: &[Credit], free_balance_timeout: U256) -> Result<Self> {
        self.get_app_instance(identity_hash)?;
        self.check_credits(credits)?;
        let mut balances = self.free_balance_state()?;
        balances.deactivate(*identity_hash)?;
        balances.apply_credits(credits)?;

        let mut next = self.clone();
        next.app_instances.remove(identity_hash);
        next.free_balance = self.free_balance.set_state(balances.encode(), free_balance_timeout);
        Ok(next)
    }

    /// Only owners hold free balance rows.
    pub fn check_credits(&self, credits: &[Credit]) -> Result<()> {
        match credits.iter().find(|c| !self.is_owner(&c.to)) {
            Some(credit) => Err(EngineError::Validation(format!(
                "outcome credits {:?}, who does not own channel {:?}",
                credit.to, self.multisig_address
            ))),
            None => Ok(()),
        }
    }

    pub fn set_app_instance(&self, app: AppInstance) -> Result<Self> {
        self.get_app_instance(&app.identity_hash)?;
        let mut next = self.clone();
        next.app_instances.insert(app.identity_hash, app);
        Ok(next)
    }

    /// Credits an observed multisig deposit to `owner`'s free balance.
    pub fn record_deposit(&self, token: Address, owner: Address, amount: U256) -> Result<Self> {
        if !self.is_owner(&owner) {
            return Err(EngineError::Validation(format!("{:?} does not own channel {:?}", owner, self.multisig_address)));
        }
        let mut balances = self.free_balance_state()?;
        balances.credit(token, owner, amount)?;
        let mut next = self.clone();
        next.free_balance = self.free_balance.set_state(balances.encode(), self.free_balance.latest_timeout());
        Ok(next)
    }

    /// Looks up an app, proposal or the free balance by identity hash.
    pub fn find_app(&self, identity_hash: &H256) -> Option<&AppInstance> {
        if self.free_balance.identity_hash == *identity_hash {
            return Some(&self.free_balance);
        }
        self.app_instances.get(identity_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_instance::AppInterface;
    use crate::outcome::InterpreterParams;
    use crate::types::ETH_ASSET_ID;
    use ethers::types::Bytes;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn channel() -> StateChannel {
        let mut channel = StateChannel::setup(
            addr(0xcc),
            ContractAddresses::default(),
            addr(2),
            addr(1),
            addr(0xfb),
            U256::from(100),
            &[ETH_ASSET_ID],
            1337,
        )
        .unwrap();
        let mut fb = channel.free_balance_state().unwrap();
        fb.credit(ETH_ASSET_ID, addr(2), U256::from(100)).unwrap();
        channel.free_balance.latest_state = fb.encode();
        channel
    }

    fn proposal(channel: &StateChannel, deposit: u64) -> AppProposal {
        let seq = channel.next_app_seq_no();
        let mut proposal = AppProposal {
            identity_hash: H256::zero(),
            multisig_address: channel.multisig_address,
            initiator_identifier: addr(2),
            responder_identifier: addr(1),
            app_interface: AppInterface { addr: addr(0xaa), state_encoding: String::new(), action_encoding: None },
            default_timeout: U256::from(10),
            state_timeout: U256::from(10),
            initial_state: Bytes::default(),
            app_seq_no: seq,
            interpreter_params: InterpreterParams::SingleAssetTwoPartyCoinTransfer {
                limit: U256::from(deposit),
                token_address: ETH_ASSET_ID,
            },
            initiator_deposit: U256::from(deposit),
            initiator_deposit_asset_id: ETH_ASSET_ID,
            responder_deposit: U256::zero(),
            responder_deposit_asset_id: ETH_ASSET_ID,
            meta: None,
        };
        proposal.identity_hash = proposal.identity().identity_hash();
        proposal
    }

    #[test]
    fn owners_are_sorted() {
        assert_eq!(channel().multisig_owners(), vec![addr(1), addr(2)]);
        assert_eq!(channel().counterparty_of(&addr(1)).unwrap(), addr(2));
        assert!(channel().counterparty_of(&addr(3)).is_err());
    }

    #[test]
    fn install_debits_free_balance() {
        let channel = channel();
        let p = proposal(&channel, 60);
        let proposed = channel.add_proposal(p.clone()).unwrap();
        assert_eq!(proposed.monotonic_num_proposed_apps, 1);
        let installed = proposed.install_app(p.to_app_instance(), U256::from(100)).unwrap();
        let fb = installed.free_balance_state().unwrap();
        assert_eq!(fb.balance_of(&ETH_ASSET_ID, &addr(2)), U256::from(40));
        assert_eq!(fb.active_apps, vec![p.identity_hash]);
        assert_eq!(installed.free_balance.latest_version_number, 1);
        assert!(installed.proposed_app_instances.is_empty());
    }

    #[test]
    fn deposits_credit_owners_only() {
        let channel = channel();
        let funded = channel.record_deposit(ETH_ASSET_ID, addr(1), U256::from(5)).unwrap();
        assert_eq!(funded.free_balance_state().unwrap().balance_of(&ETH_ASSET_ID, &addr(1)), U256::from(5));
        assert_eq!(funded.free_balance.latest_version_number, 1);
        assert!(channel.record_deposit(ETH_ASSET_ID, addr(9), U256::one()).is_err());
    }

    #[test]
    fn uninstall_credits_owners_only() {
        let channel = channel();
        let p = proposal(&channel, 60);
        let installed = channel
            .add_proposal(p.clone())
            .unwrap()
            .install_app(p.to_app_instance(), U256::from(100))
            .unwrap();
        let stranger = [Credit { token: ETH_ASSET_ID, to: addr(9), amount: U256::from(60) }];
        let err = installed.uninstall_app(&p.identity_hash, &stranger, U256::from(100)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let owner = [Credit { token: ETH_ASSET_ID, to: addr(1), amount: U256::from(60) }];
        let uninstalled = installed.uninstall_app(&p.identity_hash, &owner, U256::from(100)).unwrap();
        let fb = uninstalled.free_balance_state().unwrap();
        assert_eq!(fb.balance_of(&ETH_ASSET_ID, &addr(1)), U256::from(60));
        assert_eq!(fb.balance_of(&ETH_ASSET_ID, &addr(9)), U256::zero());
    }

    #[test]
    fn install_rejects_overdraft() {
        let channel = channel();
        let p = proposal(&channel, 101);
        let proposed = channel.add_proposal(p.clone()).unwrap();
        assert!(proposed.install_app(p.to_app_instance(), U256::from(100)).is_err());
    }

    #[test]
    fn proposal_must_use_next_sequence_number() {
        let channel = channel();
        let mut p = proposal(&channel, 1);
        p.app_seq_no = 5;
        assert!(channel.add_proposal(p).is_err());
    }
}
