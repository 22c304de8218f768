use crate::types::ProtocolName;
use ethers::types::{Address, H256};
use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rejected by validation middleware: {0}")]
    MiddlewareRejected(String),

    #[error("app definition {0:?} is not registered")]
    UnknownAppDefinition(Address),

    #[error("signature recovered to {recovered:?}, expected one of {expected:?}")]
    Signature {
        recovered: Address,
        expected: Vec<Address>,
    },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("missing signature: {0}")]
    MissingSignature(String),

    #[error("could not acquire lock {name} within {timeout_ms}ms")]
    LockTimeout { name: String, timeout_ms: u64 },

    #[error("no response from {peer:?} within {timeout_ms}ms")]
    ProtocolTimeout { peer: Address, timeout_ms: u64 },

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("chain error during {operation}: {details}")]
    Chain { operation: String, details: String },

    #[error("storage error during {operation}: {details}")]
    Storage { operation: String, details: String },

    #[error("{format} serialization error: {details}")]
    Serialization { format: String, details: String },

    #[error("abi error: {0}")]
    Abi(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("app {identity_hash:?} rejected action: {reason}")]
    InvalidAction { identity_hash: H256, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{protocol} protocol failed at step {seq}: {source}")]
    Protocol {
        protocol: ProtocolName,
        seq: u8,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Debug) -> Self {
        EngineError::NotFound { kind, id: format!("{:?}", id) }
    }

    /// Tags the error with the protocol step it surfaced in. Already tagged errors
    /// keep their original step.
    pub fn at_step(self, protocol: ProtocolName, seq: u8) -> Self {
        match self {
            EngineError::Protocol { .. } => self,
            other => EngineError::Protocol { protocol, seq, source: Box::new(other) },
        }
    }

    /// The innermost error, looking through protocol step tags.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Protocol { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), EngineError::LockTimeout { .. } | EngineError::ProtocolTimeout { .. })
    }
}

#[macro_export]
macro_rules! storage_err {
    ($op:expr, $err:expr) => {
        $crate::error::EngineError::Storage { operation: $op.into(), details: $err.to_string() }
    };
}

#[macro_export]
macro_rules! serde_err {
    ($fmt:expr, $err:expr) => {
        $crate::error::EngineError::Serialization { format: $fmt.into(), details: $err.to_string() }
    };
}

#[macro_export]
macro_rules! chain_err {
    ($op:expr, $err:expr) => {
        $crate::error::EngineError::Chain { operation: $op.into(), details: $err.to_string() }
    };
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        serde_err!("json", err)
    }
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        serde_err!("bincode", err)
    }
}

impl From<ethers::abi::Error> for EngineError {
    fn from(err: ethers::abi::Error) -> Self {
        EngineError::Abi(err.to_string())
    }
}

impl From<rocksdb::Error> for EngineError {
    fn from(err: rocksdb::Error) -> Self {
        storage_err!("rocksdb", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_tag_is_applied_once() {
        let err = EngineError::Validation("bad".into())
            .at_step(ProtocolName::Install, 2)
            .at_step(ProtocolName::Install, 3);
        match &err {
            EngineError::Protocol { seq, protocol, .. } => {
                assert_eq!(*seq, 2);
                assert_eq!(*protocol, ProtocolName::Install);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(err.root(), EngineError::Validation(_)));
        assert_eq!(err.to_string(), "install protocol failed at step 2: validation failed: bad");
    }

    #[test]
    fn timeouts_are_distinct_from_validation() {
        let lock = EngineError::LockTimeout { name: "m".into(), timeout_ms: 5 }.at_step(ProtocolName::Setup, 0);
        assert!(lock.is_timeout());
        assert!(!EngineError::Validation("x".into()).is_timeout());
    }
}
