use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{BatchOp, KvStore, FENCE_KEY};
use crate::error::RaftError;

/// In-memory `KvStore` used by tests and `db=memory`.
pub struct MemoryStore {
    inner: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, RaftError> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), RaftError> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), RaftError> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }

    fn apply_batch(&self, ops: &[BatchOp]) -> Result<(), RaftError> {
        let mut guard = self.inner.lock().unwrap();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => {
                    guard.insert(k.clone(), v.clone());
                }
                BatchOp::Delete(k) => {
                    guard.remove(k);
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), RaftError> {
        Ok(())
    }

    fn last_applied_index(&self) -> Result<u64, RaftError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .get(FENCE_KEY)
            .map(|v| u64::from_be_bytes(v.as_slice().try_into().unwrap_or([0; 8])))
            .unwrap_or(0))
    }

    fn set_last_applied_index(&self, index: u64) -> Result<(), RaftError> {
        self.inner
            .lock()
            .unwrap()
            .insert(FENCE_KEY.to_vec(), index.to_be_bytes().to_vec());
        Ok(())
    }

    fn snapshot_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RaftError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn restore_all(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), RaftError> {
        let mut guard = self.inner.lock().unwrap();
        guard.clear();
        for (k, v) in entries {
            guard.insert(k, v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let s = MemoryStore::new();
        s.put(b"a", b"1").unwrap();
        assert_eq!(s.get(b"a").unwrap(), Some(b"1".to_vec()));
        s.delete(b"a").unwrap();
        assert_eq!(s.get(b"a").unwrap(), None);
    }

    #[test]
    fn batch_applies_in_order() {
        let s = MemoryStore::new();
        s.apply_batch(&[
            BatchOp::Put(b"a".to_vec(), b"1".to_vec()),
            BatchOp::Put(b"a".to_vec(), b"2".to_vec()),
            BatchOp::Delete(b"b".to_vec()),
        ])
        .unwrap();
        assert_eq!(s.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn fencing_token_persists_across_sets() {
        let s = MemoryStore::new();
        assert_eq!(s.last_applied_index().unwrap(), 0);
        s.set_last_applied_index(42).unwrap();
        assert_eq!(s.last_applied_index().unwrap(), 42);
    }

    #[test]
    fn restore_replaces_all_contents() {
        let s = MemoryStore::new();
        s.put(b"stale", b"x").unwrap();
        s.restore_all(vec![(b"a".to_vec(), b"1".to_vec())]).unwrap();
        assert_eq!(s.get(b"stale").unwrap(), None);
        assert_eq!(s.get(b"a").unwrap(), Some(b"1".to_vec()));
    }
}
