use super::backend::{BatchOp, KvBackend};
use crate::error::Result;
use crate::storage_err;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.inner.lock().map_err(|_| storage_err!("memory backend lock", "poisoned"))
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock_inner()?.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .lock_inner()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: Vec<BatchOp>) -> Result<()> {
        let mut inner = self.lock_inner()?;
        for op in batch {
            match op {
                BatchOp::Put { key, value } => {
                    inner.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.lock_inner()?.clear();
        Ok(())
    }
}
