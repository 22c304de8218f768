use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl BatchOp {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        BatchOp::Put { key: key.into(), value }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        BatchOp::Delete { key: key.into() }
    }
}

/// Raw key-value engine underneath [`super::Store`]. `write` must apply the whole
/// batch or nothing.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    fn write(&self, batch: Vec<BatchOp>) -> Result<()>;

    fn clear(&self) -> Result<()>;
}
