use super::{BatchOp, Store, CONDITIONAL, SETUP, SET_STATE, STORE_SCHEMA_VERSION, WITHDRAW};
use crate::commitments::{
    ConditionalTransactionCommitment, EthereumCommitment, SetStateCommitment, SetupCommitment, WithdrawCommitment,
};
use crate::error::Result;
use log::info;

/// Brings a store written at schema `from` up to [`STORE_SCHEMA_VERSION`].
/// Stores without a recorded version predate versioning and are treated as v1.
pub(super) fn run(store: &Store, from: u32) -> Result<()> {
    let mut version = from.max(1);
    while version < STORE_SCHEMA_VERSION {
        if version == 1 {
            rederive_transaction_data(store)?;
        }
        version += 1;
        store.update_schema_version(version)?;
        info!("store schema now at {}", version);
    }
    Ok(())
}

/// v1 -> v2: v1 records could carry a `transactionData` that no longer matched
/// their fields. Every commitment is rewritten with one derived from its fields.
fn rederive_transaction_data(store: &Store) -> Result<()> {
    let mut batch = Vec::new();
    batch.extend(rewrite::<SetupCommitment>(store, SETUP)?);
    batch.extend(rewrite::<SetStateCommitment>(store, SET_STATE)?);
    batch.extend(rewrite::<ConditionalTransactionCommitment>(store, CONDITIONAL)?);
    batch.extend(rewrite::<WithdrawCommitment>(store, WITHDRAW)?);
    info!("re-deriving transaction data for {} commitments", batch.len());
    store.backend().write(batch)
}

fn rewrite<C: EthereumCommitment>(store: &Store, prefix: &str) -> Result<Vec<BatchOp>> {
    store
        .backend()
        .scan_prefix(prefix)?
        .into_iter()
        .map(|(key, bytes)| {
            let commitment = C::from_json(serde_json::from_slice(&bytes)?)?;
            Ok(BatchOp::put(key, serde_json::to_vec(&commitment.to_json()?)?))
        })
        .collect()
}
