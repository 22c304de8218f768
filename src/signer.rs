use crate::error::{EngineError, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256};
use std::str::FromStr;

/// A party's channel signing key. Its address is the party's identifier in
/// every channel, commitment and protocol message.
#[derive(Clone, Debug)]
pub struct ChannelSigner {
    wallet: LocalWallet,
}

impl ChannelSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Parses a hex encoded secp256k1 private key, with or without `0x`.
    pub fn from_private_key(key: &str) -> Result<Self> {
        let key = key.trim().trim_start_matches("0x");
        let wallet = LocalWallet::from_str(key).map_err(|e| EngineError::Config(format!("invalid signing key: {e}")))?;
        Ok(Self::new(wallet))
    }

    pub fn random() -> Self {
        Self::new(LocalWallet::new(&mut ethers::core::rand::thread_rng()))
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }

    /// Signs a raw 32 byte digest, no message prefix is applied.
    pub fn sign_digest(&self, digest: H256) -> Result<Signature> {
        self.wallet
            .sign_hash(digest)
            .map_err(|e| EngineError::InvalidSignature(format!("signing failed: {e}")))
    }
}

pub fn recover_signer(digest: H256, signature: &Signature) -> Result<Address> {
    signature
        .recover(digest)
        .map_err(|e| EngineError::InvalidSignature(e.to_string()))
}

/// Fails unless `signature` over `digest` recovers to `expected`.
pub fn assert_signed_by(digest: H256, signature: &Signature, expected: Address) -> Result<()> {
    let recovered = recover_signer(digest, signature)?;
    if recovered != expected {
        return Err(EngineError::Signature { recovered, expected: vec![expected] });
    }
    Ok(())
}
