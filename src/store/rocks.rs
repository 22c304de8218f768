use super::backend::{BatchOp, KvBackend};
use crate::error::Result;
use crate::storage_err;
use log::{debug, info};
use rocksdb::{Direction, IteratorMode, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

/// RocksDB engine. Batches go through a `WriteBatch` so compound writes land
/// atomically.
#[derive(Clone)]
pub struct RocksBackend {
    db: Arc<DB>,
}

impl RocksBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("opening rocksdb store path={}", path.display());
        std::fs::create_dir_all(path).map_err(|e| storage_err!("create store dir", e))?;
        let db = DB::open_default(path).map_err(|e| storage_err!("rocksdb open", e))?;
        info!("rocksdb store opened path={}", path.display());
        Ok(Self { db: Arc::new(db) })
    }
}

impl KvBackend for RocksBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db.get(key.as_bytes()).map_err(|e| storage_err!("rocksdb get", e))
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut found = Vec::new();
        let iter = self.db.iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| storage_err!("rocksdb scan", e))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec()).map_err(|e| storage_err!("rocksdb key decode", e))?;
            found.push((key, value.to_vec()));
        }
        Ok(found)
    }

    fn write(&self, batch: Vec<BatchOp>) -> Result<()> {
        let mut write = WriteBatch::default();
        for op in batch {
            match op {
                BatchOp::Put { key, value } => write.put(key.as_bytes(), value),
                BatchOp::Delete { key } => write.delete(key.as_bytes()),
            }
        }
        self.db.write(write).map_err(|e| storage_err!("rocksdb write", e))
    }

    fn clear(&self) -> Result<()> {
        let mut write = WriteBatch::default();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item.map_err(|e| storage_err!("rocksdb scan", e))?;
            write.delete(key);
        }
        self.db.write(write).map_err(|e| storage_err!("rocksdb clear", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn batches_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = RocksBackend::open(dir.path()).unwrap();
            backend
                .write(vec![BatchOp::put("channel/1", b"one".to_vec()), BatchOp::put("channel/2", b"two".to_vec())])
                .unwrap();
            backend.write(vec![BatchOp::delete("channel/2")]).unwrap();
        }
        let backend = RocksBackend::open(dir.path()).unwrap();
        assert_eq!(backend.get("channel/1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(backend.scan_prefix("channel/").unwrap().len(), 1);
        backend.clear().unwrap();
        assert!(backend.scan_prefix("").unwrap().is_empty());
    }
}
