use super::{EthereumCommitment, SignatureSlots};
use crate::app_instance::AppInstance;
use crate::chain::abi;
use crate::error::Result;
use crate::serde_err;
use crate::types::{hash_bytes, u256_word, AppIdentity, CommitmentTarget, MinimalTransaction};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// Authorizes submitting `(appStateHash, versionNumber, stateTimeout)` for an
/// app to the challenge registry. A single signature is enough when the signer
/// is the app's turn taker, so this is the one commitment that may be redeemed
/// half signed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetStateCommitment {
    pub challenge_registry: Address,
    pub app_identity: AppIdentity,
    pub app_identity_hash: H256,
    pub app_state_hash: H256,
    pub version_number: u64,
    pub state_timeout: U256,
    pub signatures: SignatureSlots,
}

impl SetStateCommitment {
    pub fn new(
        challenge_registry: Address,
        app_identity: AppIdentity,
        app_state_hash: H256,
        version_number: u64,
        state_timeout: U256,
    ) -> Self {
        Self {
            challenge_registry,
            app_identity_hash: app_identity.identity_hash(),
            app_identity,
            app_state_hash,
            version_number,
            state_timeout,
            signatures: [None, None],
        }
    }

    /// Commitment to an app's latest state.
    pub fn for_app(challenge_registry: Address, app: &AppInstance) -> Self {
        Self::new(
            challenge_registry,
            app.identity(),
            app.state_hash(),
            app.latest_version_number,
            app.latest_timeout(),
        )
    }
}

impl EthereumCommitment for SetStateCommitment {
    /// `keccak256(SET_STATE ‖ identityHash ‖ appStateHash ‖ versionNumber ‖ stateTimeout)`
    fn signing_digest(&self) -> H256 {
        let mut packed = Vec::with_capacity(1 + 32 * 4);
        packed.push(CommitmentTarget::SetState as u8);
        packed.extend_from_slice(self.app_identity_hash.as_bytes());
        packed.extend_from_slice(self.app_state_hash.as_bytes());
        packed.extend_from_slice(&u256_word(U256::from(self.version_number)));
        packed.extend_from_slice(&u256_word(self.state_timeout));
        hash_bytes(&packed)
    }

    fn transaction(&self) -> Result<MinimalTransaction> {
        Ok(MinimalTransaction {
            to: self.challenge_registry,
            value: U256::zero(),
            data: abi::set_state(
                &self.app_identity,
                self.app_state_hash,
                self.version_number,
                self.state_timeout,
                &self.ordered_signatures(),
            ),
        })
    }

    fn participants(&self) -> &[Address] {
        &self.app_identity.participants
    }

    fn signature_slots(&self) -> &SignatureSlots {
        &self.signatures
    }

    fn signature_slots_mut(&mut self) -> &mut SignatureSlots {
        &mut self.signatures
    }

    fn min_signatures(&self) -> usize {
        1
    }

    fn check_integrity(&self) -> Result<()> {
        let derived = self.app_identity.identity_hash();
        if derived != self.app_identity_hash {
            return Err(serde_err!(
                "json",
                format!("appIdentityHash {:?} does not match appIdentity hash {:?}", self.app_identity_hash, derived)
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitments::test_utils::{sign, signers};
    use crate::error::EngineError;
    use crate::signer::{recover_signer, ChannelSigner};
    use crate::types::sort_addresses;

    fn commitment(a: &ChannelSigner, b: &ChannelSigner) -> SetStateCommitment {
        let identity = AppIdentity {
            multisig_address: Address::repeat_byte(1),
            channel_nonce: U256::from(1),
            participants: sort_addresses(vec![a.address(), b.address()]),
            app_definition: Address::repeat_byte(2),
            default_timeout: U256::from(10),
        };
        SetStateCommitment::new(Address::repeat_byte(3), identity, H256::repeat_byte(4), 2, U256::from(10))
    }

    #[test]
    fn signatures_land_in_participant_order() {
        let (a, b) = signers();
        let mut c = commitment(&a, &b);
        let (sig_a, sig_b) = (sign(&c, &a), sign(&c, &b));
        c.add_signatures(Some(sig_b), Some(sig_a)).unwrap();
        for (slot, participant) in c.signatures.iter().zip(c.participants()) {
            let sig = slot.as_ref().unwrap();
            assert_eq!(recover_signer(c.signing_digest(), sig).unwrap(), *participant);
        }
    }

    #[test]
    fn single_signature_is_enough_but_none_is_not() {
        let (a, b) = signers();
        let mut c = commitment(&a, &b);
        assert!(matches!(c.assert_signatures(), Err(EngineError::MissingSignature(_))));
        let sig = sign(&c, &a);
        c.add_signatures(Some(sig), None).unwrap();
        c.assert_signatures().unwrap();
        assert!(!c.is_fully_signed());
    }

    #[test]
    fn stranger_signature_leaves_commitment_untouched() {
        let (a, b) = signers();
        let stranger = ChannelSigner::random();
        let mut c = commitment(&a, &b);
        let good = sign(&c, &a);
        let bad = sign(&c, &stranger);
        let err = c.add_signatures(Some(good), Some(bad)).unwrap_err();
        assert!(matches!(err, EngineError::Signature { .. }));
        assert_eq!(c.signature_count(), 0);
    }

    #[test]
    fn json_round_trip_keeps_digest_and_transaction() {
        let (a, b) = signers();
        let mut c = commitment(&a, &b);
        let (sig_a, sig_b) = (sign(&c, &a), sign(&c, &b));
        c.add_signatures(Some(sig_a), Some(sig_b)).unwrap();
        let json = c.to_json().unwrap();
        assert!(json.get("transactionData").is_some());
        assert!(json.get("appIdentityHash").is_some());
        let restored = SetStateCommitment::from_json(json).unwrap();
        assert_eq!(restored.signing_digest(), c.signing_digest());
        assert_eq!(restored.transaction().unwrap(), c.transaction().unwrap());
    }

    #[test]
    fn stale_transaction_data_is_not_trusted() {
        let (a, b) = signers();
        let c = commitment(&a, &b);
        let mut json = c.to_json().unwrap();
        json["transactionData"] = serde_json::Value::String("0xdeadbeef".into());
        let restored = SetStateCommitment::from_json(json).unwrap();
        assert_eq!(restored.transaction().unwrap().data, c.transaction().unwrap().data);
    }

    #[test]
    fn mismatched_identity_hash_is_rejected() {
        let (a, b) = signers();
        let c = commitment(&a, &b);
        let mut json = c.to_json().unwrap();
        json["appIdentityHash"] = serde_json::to_value(H256::repeat_byte(9)).unwrap();
        let err = SetStateCommitment::from_json(json).unwrap_err();
        assert!(matches!(err, EngineError::Serialization { .. }));
    }

    #[test]
    fn edited_identity_is_rejected() {
        let (a, b) = signers();
        let c = commitment(&a, &b);
        let mut json = c.to_json().unwrap();
        json["appIdentity"]["defaultTimeout"] = serde_json::to_value(U256::from(99)).unwrap();
        assert!(SetStateCommitment::from_json(json).is_err());
    }
}
