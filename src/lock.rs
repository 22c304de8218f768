use crate::error::{EngineError, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Named mutual exclusion. Protocol runs take the lock named after their
/// multisig, so runs on one channel are serialized while channels proceed in
/// parallel.
#[derive(Clone, Default)]
pub struct LockService {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl LockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` while holding `name`. Fails with `LockTimeout` if the lock is
    /// not acquired within `timeout`; the lock is released however `work` ends.
    pub async fn acquire_lock<F, T>(&self, name: &str, timeout: Duration, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(name.to_string()).or_default().clone()
        };
        let guard = match tokio::time::timeout(timeout, lock.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!("lock {} not acquired within {:?}", name, timeout);
                self.release(name, lock).await;
                return Err(EngineError::LockTimeout { name: name.to_string(), timeout_ms: timeout.as_millis() as u64 });
            }
        };
        debug!("lock {} acquired", name);
        let result = work.await;
        drop(guard);
        self.release(name, lock).await;
        debug!("lock {} released", name);
        result
    }

    /// Drops the entry for `name` once no other run holds or awaits it.
    async fn release(&self, name: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(name);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
